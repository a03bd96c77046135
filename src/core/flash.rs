//! One-shot flash messages carried in a cookie.
//!
//! The cookie value is URL-escaped; each message is `\0key#SEP#value\0`, where `SEP` is the
//! configured separator. Reading clears the cookie.
use cookie::Cookie;

use crate::core::context::RequestContext;

/// Parse a flash cookie value into key/value pairs
pub fn decode(raw: &str, separator: &str) -> Vec<(String, String)> {
    let unescaped = raw.replace('+', " ");
    let value = match urlencoding::decode(&unescaped) {
        Ok(value) => value.into_owned(),
        Err(e) => {
            tracing::debug!("Ignoring undecodable flash cookie: {}", e);
            return Vec::new();
        }
    };
    let delimiter = format!("#{separator}#");
    value
        .split('\0')
        .filter(|item| !item.is_empty())
        .filter_map(|item| {
            let parts: Vec<&str> = item.split(&delimiter).collect();
            match parts.as_slice() {
                [key, value] => Some((key.to_string(), value.to_string())),
                _ => None,
            }
        })
        .collect()
}

/// Encode key/value pairs as a flash cookie value
pub fn encode<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>, separator: &str) -> String {
    let raw: String = pairs
        .into_iter()
        .map(|(key, value)| format!("\0{key}#{separator}#{value}\0"))
        .collect();
    urlencoding::encode(&raw).into_owned()
}

impl RequestContext {
    /// Move flash messages from the request cookie into the view and clear the cookie
    pub fn read_flash_data(&mut self) {
        let web = &self.services().web;
        let name = web.flash_name.clone();
        let separator = web.flash_separator.clone();
        let Some(raw) = self.input.cookie(&name) else {
            return;
        };
        for (key, value) in decode(&raw, &separator) {
            self.view.flash.insert(key, value);
        }
        let mut removal = Cookie::build((name, "")).path("/").build();
        removal.make_removal();
        self.output.cookie(&removal);
    }

    /// Write the view's flash messages to the flash cookie for the next request
    pub fn store_flash(&mut self) {
        let web = &self.services().web;
        let name = web.flash_name.clone();
        let value = encode(&self.view.flash, &web.flash_separator);
        let cookie = Cookie::build((name, value)).path("/").build();
        self.output.cookie(&cookie);
    }

    /// Set a flash message once per request and store it
    pub fn flash(&mut self, key: &str, message: impl Into<String>) {
        if self.view.flash.contains_key(key) {
            return;
        }
        self.view.flash.insert(key.to_string(), message.into());
        self.store_flash();
    }

    pub fn flash_success(&mut self, message: impl Into<String>) {
        self.flash("success", message);
    }

    pub fn flash_notice(&mut self, message: impl Into<String>) {
        self.flash("notice", message);
    }

    pub fn flash_warning(&mut self, message: impl Into<String>) {
        self.flash("warning", message);
    }

    pub fn flash_error(&mut self, message: impl Into<String>) {
        self.flash("error", message);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_decode_cookie_value() {
        let raw = "%00notice%23TRELLISFLASH%23saved%20ok%00%00error%23TRELLISFLASH%23bad%00";
        assert_eq!(
            decode(raw, "TRELLISFLASH"),
            vec![
                ("notice".to_string(), "saved ok".to_string()),
                ("error".to_string(), "bad".to_string())
            ]
        );
    }

    #[test]
    fn test_decode_skips_malformed_pairs() {
        let raw = urlencoding::encode("\0nokey\0\0a#S#b#S#c\0\0k#S#v\0").into_owned();
        assert_eq!(decode(&raw, "S"), vec![("k".to_string(), "v".to_string())]);
    }

    #[test]
    fn test_encode_matches_decode() {
        let mut flash = BTreeMap::new();
        flash.insert("notice".to_string(), "a+b & c".to_string());
        let encoded = encode(&flash, "SEP");
        assert_eq!(
            decode(&encoded, "SEP"),
            vec![("notice".to_string(), "a+b & c".to_string())]
        );
    }
}
