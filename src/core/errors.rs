//! Status-code handler registry and the built-in error pages.
//!
//! `ErrorHandlers::exception` looks up the handler for a status and falls back through
//! 503 and 500 before writing a plain-text status line.
use std::{collections::HashMap, fmt::Write as _, sync::Arc};

use hyper::StatusCode;

use crate::{
    config::models::EnvMode,
    core::{context::RequestContext, controller::Fault},
};

/// Writes the page for an error status into the context
pub type ErrorHandlerFn = Arc<dyn Fn(&mut RequestContext, StatusCode) + Send + Sync>;

const DEFAULT_PAGES: &[(u16, &str)] = &[
    (
        401,
        "The page you have requested can't be authorized.<br>Perhaps you are here because:\
         <ul><li>The credentials you supplied are incorrect</li>\
         <li>There are errors in the website</li></ul>",
    ),
    (
        402,
        "The page you have requested requires payment.<br>Perhaps you are here because:\
         <ul><li>The credentials you supplied are incorrect</li>\
         <li>There are errors in the website</li></ul>",
    ),
    (
        403,
        "The page you have requested is forbidden.<br>Perhaps you are here because:\
         <ul><li>Your address may be blocked</li><li>The site may be disabled</li>\
         <li>You need to log in</li></ul>",
    ),
    (
        404,
        "The page you have requested is no longer available.<br>Perhaps you are here because:\
         <ul><li>The page has moved</li><li>The page no longer exists</li></ul>",
    ),
    (
        405,
        "The method you have requested is not allowed.<br>Perhaps you are here because:\
         <ul><li>The method specified is not allowed by the resource identified by the \
         Request-URI</li></ul>",
    ),
    (
        413,
        "The page you have requested is unavailable.<br>Perhaps you are here because:\
         <ul><li>The request entity is larger than limits defined by server</li>\
         <li>Please change the request entity and try again</li></ul>",
    ),
    (
        417,
        "The page you have requested is forbidden.<br>Perhaps you are here because:\
         <ul><li>The security token supplied with the request is invalid</li></ul>",
    ),
    (
        422,
        "The page you have requested is forbidden.<br>Perhaps you are here because:\
         <ul><li>The request is missing its security token</li></ul>",
    ),
    (
        500,
        "The page you have requested is down right now.\
         <ul><li>Please try again later, this issue has been reported to the website \
         administrator</li></ul>",
    ),
    (
        501,
        "The page you have requested is not implemented.\
         <ul><li>Please try again later, this issue has been reported to the website \
         administrator</li></ul>",
    ),
    (
        502,
        "The page you have requested is down right now.\
         <ul><li>The server, while acting as a gateway or proxy, received an invalid \
         response from the upstream server</li><li>Please try again later</li></ul>",
    ),
    (
        503,
        "The page you have requested is unavailable.<br>Perhaps you are here because:\
         <ul><li>The page is overloaded</li><li>Please try again later</li></ul>",
    ),
    (
        504,
        "The page you have requested is unavailable.<br>Perhaps you are here because:\
         <ul><li>The server, while acting as a gateway or proxy, did not receive a timely \
         response from the upstream server</li><li>Please try again later</li></ul>",
    ),
];

/// Registry of error pages keyed by status code
#[derive(Clone, Default)]
pub struct ErrorHandlers {
    handlers: HashMap<u16, ErrorHandlerFn>,
}

impl ErrorHandlers {
    /// Registry without any handlers; every error falls back to plain text
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in pages for the standard 4xx/5xx codes
    pub fn with_defaults(env_mode: EnvMode) -> Self {
        let mut handlers = Self::empty();
        for (code, content) in DEFAULT_PAGES {
            let Ok(status) = StatusCode::from_u16(*code) else {
                continue;
            };
            let content: &'static str = content;
            handlers.register(status, move |ctx, status| {
                let page = match env_mode {
                    EnvMode::Development => development_page(ctx, status),
                    EnvMode::Production => production_page(status, content),
                };
                ctx.html(status, page);
            });
        }
        handlers
    }

    pub fn register<F>(&mut self, status: StatusCode, handler: F)
    where
        F: Fn(&mut RequestContext, StatusCode) + Send + Sync + 'static,
    {
        self.handlers.insert(status.as_u16(), Arc::new(handler));
    }

    pub fn remove(&mut self, status: StatusCode) -> bool {
        self.handlers.remove(&status.as_u16()).is_some()
    }

    pub fn lookup(&self, status: StatusCode) -> Option<&ErrorHandlerFn> {
        self.handlers.get(&status.as_u16())
    }

    /// Answer with the page for `status`, falling back to 503 then 500, then plain text
    pub fn exception(&self, status: StatusCode, ctx: &mut RequestContext) {
        for code in [
            status,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::INTERNAL_SERVER_ERROR,
        ] {
            if let Some(handler) = self.lookup(code) {
                ctx.output.set_status(code);
                handler(ctx, code);
                return;
            }
        }
        ctx.output.set_status(status);
        ctx.text(status, status.as_str().to_string());
    }
}

impl std::fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut codes: Vec<_> = self.handlers.keys().collect();
        codes.sort();
        f.debug_struct("ErrorHandlers").field("codes", &codes).finish()
    }
}

/// Minimal HTML escaping for text interpolated into the built-in pages
pub fn html_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn reason(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Error")
}

fn production_page(status: StatusCode, content: &str) -> String {
    let title = format!("{} {}", status.as_u16(), reason(status));
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ background-color: #efefef; font: .9em sans-serif; }}
#wrapper {{ width: 600px; margin: 40px auto 0; background: #fff; box-shadow: 5px 5px 10px rgba(0,0,0,.3); }}
.navtop {{ background-color: #24b2eb; padding: 13px; color: #fff; text-align: center; }}
.content {{ padding: 10px 10px 25px; color: #333; }}
</style>
</head>
<body>
<div id="wrapper">
<div class="navtop"><h1>{title}</h1></div>
<div class="content">{content}<p><a href="/">Go Home</a></p></div>
</div>
</body>
</html>
"#
    )
}

fn development_page(ctx: &RequestContext, status: StatusCode) -> String {
    diagnostic_page(
        &format!("Error : {}", status.as_u16()),
        ctx.input.method().as_str(),
        &ctx.input.uri().to_string(),
        &ctx.input.ip(),
        "[stack]",
    )
}

/// Diagnostic page shown for handler faults in development mode
pub fn fault_page(app_name: &str, ctx: &RequestContext, fault: &Fault) -> String {
    diagnostic_page(
        &format!("{app_name}:{}", fault.message),
        ctx.input.method().as_str(),
        &ctx.input.uri().to_string(),
        &ctx.input.ip(),
        &fault.backtrace,
    )
}

fn diagnostic_page(
    app_error: &str,
    method: &str,
    url: &str,
    remote_addr: &str,
    stack: &str,
) -> String {
    let mut page = String::from(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Application Error</title>
<style>
html, body { padding: 0; margin: 0; }
#header { background: #a31515; padding: 20px 10px; color: #fff; }
#content { padding: 5px; }
#content .stack b { font-size: 13px; color: red; }
#content .stack pre { padding-left: 10px; }
td.t { text-align: right; padding-right: 5px; color: #888; }
</style>
</head>
<body>
"#,
    );

    let _ = write!(
        page,
        r#"<div id="header"><h2>{}</h2></div>
<div id="content">
<table>
<tr><td class="t">Request Method:</td><td>{}</td></tr>
<tr><td class="t">Request URL:</td><td>{}</td></tr>
<tr><td class="t">Remote Address:</td><td>{}</td></tr>
</table>
<div class="stack"><b>Stack</b><pre>{}</pre></div>
</div>
<div id="footer"><p>trellis {}</p></div>
</body>
</html>
"#,
        html_escape(app_error),
        html_escape(method),
        html_escape(url),
        html_escape(remote_addr),
        html_escape(stack),
        env!("CARGO_PKG_VERSION"),
    );
    page
}

#[cfg(test)]
mod tests {
    use hyper::{Method, Request};

    use super::*;
    use crate::core::context::ContextServices;

    fn context() -> RequestContext {
        let mut ctx = RequestContext::new(Arc::new(ContextServices::default()));
        let parts = Request::builder()
            .method(Method::GET)
            .uri("/missing?q=1")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        ctx.reset(parts, None);
        ctx
    }

    #[test]
    fn test_defaults_cover_standard_codes() {
        let handlers = ErrorHandlers::with_defaults(EnvMode::Production);
        for code in [401, 402, 403, 404, 405, 413, 417, 422, 500, 501, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(handlers.lookup(status).is_some(), "missing {code}");
        }
        assert!(handlers.lookup(StatusCode::IM_A_TEAPOT).is_none());
    }

    #[test]
    fn test_fallback_chain() {
        let mut handlers = ErrorHandlers::empty();
        handlers.register(StatusCode::SERVICE_UNAVAILABLE, |ctx, status| {
            ctx.text(status, "busy");
        });

        let mut ctx = context();
        handlers.exception(StatusCode::IM_A_TEAPOT, &mut ctx);
        assert_eq!(ctx.response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));

        let mut ctx = context();
        ErrorHandlers::empty().exception(StatusCode::NOT_FOUND, &mut ctx);
        assert_eq!(ctx.response.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(ctx.response.bytes_buffered(), 3);
    }

    #[test]
    fn test_development_page_escapes_request_data() {
        let handlers = ErrorHandlers::with_defaults(EnvMode::Development);
        let mut ctx = context();
        handlers.exception(StatusCode::NOT_FOUND, &mut ctx);
        let response = ctx.take_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let page = diagnostic_page("e", "GET", "/missing?<x>", "", "");
        assert!(page.contains("/missing?&lt;x&gt;"));
        assert!(page.contains("<pre></pre>"));
    }
}
