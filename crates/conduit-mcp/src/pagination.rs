//! Cursor-following list driver.

use crate::error::McpError;
use crate::session::WireSession;
use conduit_types::{Paginated, PaginatedParams};
use serde::de::DeserializeOwned;
use std::future::Future;

/// Call `fetch_page` with `None`, then with each returned cursor, until a page
/// comes back without one. Pages are fetched strictly one after another.
///
/// An error on any page fails the whole call; earlier pages are discarded.
pub async fn paginate<T, F, Fut>(mut fetch_page: F) -> Result<Vec<T>, McpError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>), McpError>>,
{
    let mut items = Vec::new();
    let mut cursor = None;
    loop {
        let (page, next) = fetch_page(cursor.take()).await?;
        items.extend(page);
        match next {
            Some(next) => cursor = Some(next),
            None => return Ok(items),
        }
    }
}

/// Fetch every page of a `*/list` request. Each page reuses `params` with only
/// the cursor replaced.
pub async fn list_all<R>(
    session: &dyn WireSession,
    method: &str,
    params: &PaginatedParams,
) -> Result<Vec<R::Item>, McpError>
where
    R: Paginated + DeserializeOwned,
{
    paginate(move |cursor| async move {
        let page_params = serde_json::to_value(params.with_cursor(cursor))?;
        let raw = session.send_request(method, Some(page_params)).await?;
        let page: R = serde_json::from_value(raw)?;
        Ok::<_, McpError>(page.into_page())
    })
    .await
}
