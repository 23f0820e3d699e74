//! Generic pagination over AWS listing calls.
//!
//! The services use three cursor conventions; each is a [`PageStyle`] value
//! so call sites stay declarative about which one applies.

use super::retry;
use anyhow::Result;
use serde_json::Value;
use std::future::Future;

/// A pagination token convention: the request parameter that carries the
/// cursor in and the response field that carries the next cursor out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStyle {
    pub request_param: &'static str,
    pub response_field: &'static str,
}

/// API Gateway style: `position` in, `position` out.
pub const POSITION: PageStyle = PageStyle {
    request_param: "position",
    response_field: "position",
};

/// SQS/SNS/CloudFormation style: `NextToken` in and out.
pub const NEXT_TOKEN: PageStyle = PageStyle {
    request_param: "NextToken",
    response_field: "NextToken",
};

/// Lambda style: `Marker` in, `NextMarker` out.
pub const MARKER: PageStyle = PageStyle {
    request_param: "Marker",
    response_field: "NextMarker",
};

impl PageStyle {
    /// Query-string fragment for the cursor, `&`-prefixed so it can be
    /// appended after other parameters. Empty without a cursor.
    pub fn query(&self, cursor: Option<&str>) -> String {
        match cursor {
            Some(value) => format!("&{}={}", self.request_param, urlencoding::encode(value)),
            None => String::new(),
        }
    }

    /// Inserts the cursor into a JSON request payload.
    pub fn apply(&self, payload: &mut Value, cursor: Option<&str>) {
        if let (Some(value), Some(map)) = (cursor, payload.as_object_mut()) {
            map.insert(
                self.request_param.to_string(),
                Value::String(value.to_string()),
            );
        }
    }

    fn next_cursor<'a>(&self, page: &'a Value) -> Option<&'a str> {
        page.get(self.response_field)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Fetches every page of a listing call and concatenates the `items_field`
/// arrays in the order the pages arrive. Each page fetch goes through the
/// default retry-with-backoff. Stops when a page carries no next cursor, or
/// when it carries no items at all.
pub async fn fetch_all_pages<F, Fut>(
    style: PageStyle,
    items_field: &str,
    fetch: F,
) -> Result<Vec<Value>>
where
    F: Fn(Option<String>) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = retry::with_backoff(|| fetch(cursor.clone())).await?;
        let page_items = page
            .get(items_field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let page_was_empty = page_items.is_empty();
        items.extend(page_items);
        cursor = style.next_cursor(&page).map(str::to_string);
        if cursor.is_none() || page_was_empty {
            break;
        }
    }
    Ok(items)
}
