//! Cursor-paginated list requests.

use crate::meta::Meta;
use crate::prompt::{ListPromptsResult, Prompt};
use crate::resource::{ListResourceTemplatesResult, ListResourcesResult, Resource, ResourceTemplate};
use crate::tool::{ListToolsResult, Tool};
use serde::{Deserialize, Serialize};

/// Params for every `*/list` request. `cursor` is absent on the first page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaginatedParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl PaginatedParams {
    /// Same params, different cursor.
    pub fn with_cursor(&self, cursor: Option<String>) -> Self {
        Self {
            cursor,
            meta: self.meta.clone(),
        }
    }
}

/// A single page of a list response.
pub trait Paginated {
    type Item;

    /// Split into the page's items and the cursor for the next page.
    fn into_page(self) -> (Vec<Self::Item>, Option<String>);
}

impl Paginated for ListToolsResult {
    type Item = Tool;

    fn into_page(self) -> (Vec<Tool>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Paginated for ListPromptsResult {
    type Item = Prompt;

    fn into_page(self) -> (Vec<Prompt>, Option<String>) {
        (self.prompts, self.next_cursor)
    }
}

impl Paginated for ListResourcesResult {
    type Item = Resource;

    fn into_page(self) -> (Vec<Resource>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

impl Paginated for ListResourceTemplatesResult {
    type Item = ResourceTemplate;

    fn into_page(self) -> (Vec<ResourceTemplate>, Option<String>) {
        (self.resource_templates, self.next_cursor)
    }
}
