//! Results of flow steps.
//!
//! Every step ends by either redirecting the browser or rendering a page.
//! Rendering itself belongs to the HTTP layer; a [`Page`] only says what to
//! show.

use std::collections::BTreeMap;

use serde::Serialize;
use url::Url;

/// What a completed step asks the browser to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Send the browser to another URL.
    Redirect(Url),
    /// Render a page.
    Page(Page),
}

impl Outcome {
    #[must_use]
    pub fn redirect(url: Url) -> Self {
        Self::Redirect(url)
    }

    /// Returns the redirect target, if this is a redirect.
    #[must_use]
    pub fn redirect_url(&self) -> Option<&Url> {
        match self {
            Self::Redirect(url) => Some(url),
            Self::Page(_) => None,
        }
    }

    /// Returns the page, if this renders one.
    #[must_use]
    pub fn page(&self) -> Option<&Page> {
        match self {
            Self::Page(page) => Some(page),
            Self::Redirect(_) => None,
        }
    }
}

impl From<Page> for Outcome {
    fn from(page: Page) -> Self {
        Self::Page(page)
    }
}

/// Kind of page to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// Informational message, the flow is over.
    Info,
    /// Error message, the flow is over.
    Error,
    /// The flow needs user input.
    Challenge,
}

/// A page to render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub kind: PageKind,
    /// Form or template name for challenges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Extra values for the template.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Page {
    fn new(kind: PageKind) -> Self {
        Self {
            kind,
            form: None,
            message: None,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(PageKind::Info)
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(PageKind::Error)
        }
    }

    #[must_use]
    pub fn challenge(form: impl Into<String>) -> Self {
        Self {
            form: Some(form.into()),
            ..Self::new(PageKind::Challenge)
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_serialization() {
        let page = Page::challenge("login-form").with_message("Invalid password");
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["kind"], "challenge");
        assert_eq!(json["form"], "login-form");
        assert!(json.get("attributes").is_none());
    }

    #[test]
    fn test_outcome_accessors() {
        let url = Url::parse("https://app.example.com/").unwrap();
        let outcome = Outcome::redirect(url.clone());
        assert_eq!(outcome.redirect_url(), Some(&url));
        assert!(outcome.page().is_none());

        let outcome: Outcome = Page::info("done").into();
        assert_eq!(outcome.page().unwrap().message.as_deref(), Some("done"));
    }
}
