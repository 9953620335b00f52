use std::sync::{Arc, Mutex};

use http::HeaderMap;
use http::header::{HeaderValue, SET_COOKIE};
use url::Url;

use crate::util::lock_unpoisoned;

/// Client-scoped cookie jar shared by every request and every pool generation.
#[derive(Clone, Default)]
pub struct CookieJar {
    store: Arc<Mutex<cookie_store::CookieStore>>,
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("CookieJar").finish_non_exhaustive()
    }
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one `Set-Cookie` style string as if `url` had sent it.
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        let cookies = cookie::Cookie::parse(cookie)
            .ok()
            .map(cookie::Cookie::into_owned)
            .into_iter();
        lock_unpoisoned(&self.store).store_response_cookies(cookies, url);
    }

    pub(crate) fn store_from_headers(&self, headers: &HeaderMap, url: &Url) {
        let cookies: Vec<_> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| {
                cookie::Cookie::parse(value)
                    .map(cookie::Cookie::into_owned)
                    .ok()
            })
            .collect();
        if cookies.is_empty() {
            return;
        }
        lock_unpoisoned(&self.store).store_response_cookies(cookies.into_iter(), url);
    }

    /// `Cookie` header value for a request to `url`, if any cookie matches.
    pub fn header_for(&self, url: &Url) -> Option<HeaderValue> {
        let text = lock_unpoisoned(&self.store)
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        if text.is_empty() {
            return None;
        }
        HeaderValue::from_str(&text).ok()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.store).clear();
    }
}
