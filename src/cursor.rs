//! Bounded, on-demand pagination over a server-side cursor.

use serde_json::Value;

use crate::db::{command_tag, Connection, Cursor, StructuredError};
use crate::error::{Error, Result};

/// One fetched page.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<Value>,
    /// 0-based position of this page in the stream.
    pub index: u64,
    /// Set on the page that ended the stream.
    pub complete: bool,
    pub command: String,
}

/// Wraps a [`Cursor`] and hands out pages of at most `page_size` rows.
///
/// A page shorter than `page_size` ends the stream. A full page never does,
/// so an exact multiple of `page_size` rows ends with an empty page.
pub struct Paginator {
    cursor: Option<Box<dyn Cursor>>,
    page_size: usize,
    next_index: u64,
    complete: bool,
    command: String,
}

impl Default for Paginator {
    /// A handle that was never opened; closing it is a no-op.
    fn default() -> Self {
        Self {
            cursor: None,
            page_size: 1,
            next_index: 0,
            complete: true,
            command: String::new(),
        }
    }
}

impl Paginator {
    /// Open a cursor over `text` on `conn`. The paginator owns the connection
    /// from here on.
    pub fn open(
        conn: Box<dyn Connection>,
        text: String,
        values: Vec<Value>,
        page_size: usize,
    ) -> Self {
        let command = command_tag(&text);
        tracing::debug!("Opening cursor ({} rows per page)", page_size.max(1));
        Self {
            cursor: Some(conn.open_cursor(text, values)),
            page_size: page_size.max(1),
            next_index: 0,
            complete: false,
            command,
        }
    }

    /// Page size for a configured rows-per-message value; unset or
    /// non-positive means 1.
    pub fn page_size(requested: i64) -> usize {
        usize::try_from(requested).ok().filter(|&n| n > 0).unwrap_or(1)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Fetch the next page. Fails once the stream has completed or the
    /// paginator was closed.
    pub async fn fetch_next(&mut self) -> Result<Page> {
        if self.complete {
            return Err(stream_finished());
        }
        let cursor = self.cursor.as_mut().ok_or_else(stream_finished)?;

        let rows = cursor.read(self.page_size).await?;
        let complete = rows.len() < self.page_size;
        let index = self.next_index;
        self.next_index += 1;
        self.complete = complete;

        Ok(Page {
            rows,
            index,
            complete,
            command: self.command.clone(),
        })
    }

    /// Close the cursor and release its connection. Repeated calls and calls
    /// on a never-opened paginator do nothing.
    pub async fn close(&mut self, discard: bool) {
        self.complete = true;
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close(discard).await;
        }
    }
}

fn stream_finished() -> Error {
    Error::Cursor(StructuredError::from_string(
        "Cursor stream already finished".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ConnectionConfig;
    use crate::db::Driver;
    use crate::testing::FakeDriver;
    use serde_json::json;

    async fn paginator(rows: usize, page_size: usize) -> (Paginator, FakeDriver) {
        let driver = FakeDriver::default();
        driver
            .db()
            .set_rows((0..rows).map(|i| json!({ "n": i })).collect());
        let conn = driver.connect(&ConnectionConfig::default()).await.unwrap();
        let pages = Paginator::open(conn, "SELECT n FROM t".into(), vec![], page_size);
        (pages, driver)
    }

    async fn drain(pages: &mut Paginator) -> Vec<usize> {
        let mut sizes = Vec::new();
        loop {
            let page = pages.fetch_next().await.unwrap();
            sizes.push(page.rows.len());
            if page.complete {
                return sizes;
            }
        }
    }

    #[tokio::test]
    async fn test_short_last_page_completes() {
        let (mut pages, _driver) = paginator(5, 2).await;
        assert_eq!(drain(&mut pages).await, vec![2, 2, 1]);
        assert!(pages.is_complete());
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_page() {
        let (mut pages, _driver) = paginator(4, 2).await;
        assert_eq!(drain(&mut pages).await, vec![2, 2, 0]);
    }

    #[tokio::test]
    async fn test_empty_result_is_one_empty_final_page() {
        let (mut pages, _driver) = paginator(0, 3).await;
        let page = pages.fetch_next().await.unwrap();
        assert!(page.rows.is_empty());
        assert!(page.complete);
        assert_eq!(page.index, 0);
        assert_eq!(page.command, "SELECT");
    }

    #[tokio::test]
    async fn test_indices_are_contiguous() {
        let (mut pages, _driver) = paginator(3, 1).await;
        let mut indices = Vec::new();
        loop {
            let page = pages.fetch_next().await.unwrap();
            indices.push(page.index);
            if page.complete {
                break;
            }
        }
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fetch_after_completion_fails() {
        let (mut pages, _driver) = paginator(1, 5).await;
        pages.fetch_next().await.unwrap();
        assert!(matches!(pages.fetch_next().await, Err(Error::Cursor(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut pages, driver) = paginator(5, 2).await;
        pages.fetch_next().await.unwrap();
        pages.close(false).await;
        pages.close(true).await;

        assert_eq!(driver.db().cursor_closes(), 1);
        assert_eq!(driver.db().releases(), 1);
        assert_eq!(driver.db().discards(), 0);
        assert!(pages.fetch_next().await.is_err());
    }

    #[tokio::test]
    async fn test_close_never_opened() {
        let mut pages = Paginator::default();
        pages.close(true).await;
        pages.close(false).await;
        assert!(pages.is_complete());
    }

    #[tokio::test]
    async fn test_read_failure_propagates() {
        let (mut pages, driver) = paginator(5, 2).await;
        driver.db().fail_read_at(1);
        pages.fetch_next().await.unwrap();
        assert!(matches!(pages.fetch_next().await, Err(Error::Cursor(_))));
    }

    #[test]
    fn test_page_size_defaults_to_one() {
        assert_eq!(Paginator::page_size(0), 1);
        assert_eq!(Paginator::page_size(-4), 1);
        assert_eq!(Paginator::page_size(1), 1);
        assert_eq!(Paginator::page_size(250), 250);
    }
}
