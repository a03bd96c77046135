//! Ordered route table with host, path, query and method predicates.
//!
//! Routes are tested in registration order and the first full match wins. A route whose
//! host, path and query predicates pass but whose method set rejects the request records
//! a method mismatch; a later full match clears it. Subrouters start from a copy of their
//! parent route's predicates, so registering sub-routes never changes the parent.
use std::{collections::HashMap, sync::Arc};

use hyper::{HeaderMap, Method, Uri, header};
use thiserror::Error;

use crate::core::{
    controller::{ErasedController, IntoHandler},
    route_regexp::{RegexpKind, RouteRegexp},
};

/// Methods accepted by `Route::methods` and method mappings
pub const HTTP_METHODS: &[&str] = &[
    "GET",
    "POST",
    "PUT",
    "DELETE",
    "PATCH",
    "OPTIONS",
    "HEAD",
    "TRACE",
    "CONNECT",
    "MKCOL",
    "COPY",
    "MOVE",
    "PROPFIND",
    "PROPPATCH",
    "LOCK",
    "UNLOCK",
];

/// Route registration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouteError {
    #[error("unbalanced braces in route template {template:?}")]
    UnbalancedBraces { template: String },

    #[error("missing variable name or pattern in route template {template:?}")]
    MissingVariable { template: String },

    #[error("duplicated route variable {name:?} in {template:?}")]
    DuplicateVariable { name: String, template: String },

    #[error("invalid pattern in route template {template:?}: {reason}")]
    InvalidPattern { template: String, reason: String },

    #[error("path template {template:?} must start with '/'")]
    NotAbsolute { template: String },

    #[error("invalid method mapping {mapping:?}: {reason}")]
    InvalidMethodMapping { mapping: String, reason: String },

    #[error("unknown HTTP method {0:?}")]
    UnknownMethod(String),

    #[error("action {action:?} does not exist in controller {controller}")]
    UnknownAction { action: String, controller: String },

    #[error("method mapping requires a controller on the route")]
    MissingController,
}

/// Predicates shared by a route and copied into its subrouter
#[derive(Debug, Clone, Default)]
pub struct RouteConf {
    host: Option<RouteRegexp>,
    path: Option<RouteRegexp>,
    queries: Vec<RouteRegexp>,
    methods: Option<Vec<Method>>,
}

impl RouteConf {
    fn var_names(&self) -> impl Iterator<Item = &String> {
        self.host
            .iter()
            .chain(self.path.iter())
            .chain(self.queries.iter())
            .flat_map(|rr| rr.var_names().iter())
    }

    fn ensure_unique(&self, new: &RouteRegexp, skip_path: bool) -> Result<(), RouteError> {
        let existing: Vec<&String> = self
            .host
            .iter()
            .chain(self.path.iter().filter(|_| !skip_path))
            .chain(self.queries.iter())
            .flat_map(|rr| rr.var_names().iter())
            .collect();
        match new.var_names().iter().find(|name| existing.contains(name)) {
            Some(name) => Err(RouteError::DuplicateVariable {
                name: name.clone(),
                template: new.template().to_string(),
            }),
            None => Ok(()),
        }
    }

    fn match_predicates(&self, uri: &Uri, headers: &HeaderMap) -> Option<Vec<(String, String)>> {
        let mut vars = Vec::new();

        if let Some(host) = &self.host {
            let raw = request_host(uri, headers);
            vars.extend(host.captures(host.host_subject(raw))?);
        }
        if let Some(path) = &self.path {
            vars.extend(path.captures(uri.path())?);
        }
        if !self.queries.is_empty() {
            let pairs: Vec<(String, String)> = uri
                .query()
                .map(|q| {
                    url::form_urlencoded::parse(q.as_bytes())
                        .map(|(k, v)| (k.into_owned(), v.into_owned()))
                        .collect()
                })
                .unwrap_or_default();
            for query in &self.queries {
                let key = query.query_key().unwrap_or_default();
                let captured = pairs
                    .iter()
                    .filter(|(k, _)| k == key)
                    .find_map(|(k, v)| query.captures(&format!("{k}={v}")))?;
                vars.extend(captured);
            }
        }
        Some(vars)
    }

    fn accepts(&self, method: &Method) -> bool {
        self.methods
            .as_ref()
            .is_none_or(|methods| methods.contains(method))
    }
}

fn request_host<'a>(uri: &'a Uri, headers: &'a HeaderMap) -> &'a str {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or_default()
}

fn parse_method(raw: &str) -> Result<Method, RouteError> {
    let upper = raw.trim().to_ascii_uppercase();
    if !HTTP_METHODS.contains(&upper.as_str()) {
        return Err(RouteError::UnknownMethod(raw.to_string()));
    }
    Method::from_bytes(upper.as_bytes()).map_err(|_| RouteError::UnknownMethod(raw.to_string()))
}

/// A single entry of the route table
pub struct Route {
    conf: RouteConf,
    controller: Option<Arc<dyn ErasedController>>,
    method_mapping: HashMap<String, String>,
    subrouter: Option<Router>,
}

impl Route {
    fn new(conf: RouteConf) -> Self {
        Self {
            conf,
            controller: None,
            method_mapping: HashMap::new(),
            subrouter: None,
        }
    }

    /// Match the `Host` header against a template such as `{sub}.example.com`
    pub fn host(&mut self, template: &str) -> Result<&mut Self, RouteError> {
        let rr = RouteRegexp::new(template, RegexpKind::Host)?;
        self.conf.ensure_unique(&rr, false)?;
        self.conf.host = Some(rr);
        Ok(self)
    }

    /// Match the whole path, appended to any inherited path prefix
    pub fn path(&mut self, template: &str) -> Result<&mut Self, RouteError> {
        self.set_path(template, RegexpKind::Path)
    }

    /// Match a path prefix, appended to any inherited path prefix
    pub fn path_prefix(&mut self, template: &str) -> Result<&mut Self, RouteError> {
        self.set_path(template, RegexpKind::Prefix)
    }

    fn set_path(&mut self, template: &str, kind: RegexpKind) -> Result<&mut Self, RouteError> {
        if !template.starts_with('/') {
            return Err(RouteError::NotAbsolute {
                template: template.to_string(),
            });
        }
        let full = match &self.conf.path {
            Some(parent) => format!("{}{}", parent.template().trim_end_matches('/'), template),
            None => template.to_string(),
        };
        let rr = RouteRegexp::new(&full, kind)?;
        // the inherited path is part of `full`, so only host and queries are checked here
        self.conf.ensure_unique(&rr, true)?;
        self.conf.path = Some(rr);
        Ok(self)
    }

    /// Require query pairs, e.g. `[("page", "{page:[0-9]+}")]`; an empty value accepts any
    pub fn queries(&mut self, pairs: &[(&str, &str)]) -> Result<&mut Self, RouteError> {
        for (key, value) in pairs {
            let rr = RouteRegexp::new(&format!("{key}={value}"), RegexpKind::Query)?;
            self.conf.ensure_unique(&rr, false)?;
            self.conf.queries.push(rr);
        }
        Ok(self)
    }

    /// Restrict the route to these methods (case-insensitive)
    pub fn methods(&mut self, methods: &[&str]) -> Result<&mut Self, RouteError> {
        let parsed = methods
            .iter()
            .map(|m| parse_method(m))
            .collect::<Result<Vec<_>, _>>()?;
        self.conf.methods = Some(parsed);
        Ok(self)
    }

    /// Bind a controller prototype, optionally carrying an action table
    pub fn controller(&mut self, handler: impl IntoHandler) -> &mut Self {
        self.controller = Some(handler.into_handler().into_erased());
        self
    }

    /// Map methods to action names: `"get,post:api_func;put:update"`, `*` for any method
    pub fn method_mapping(&mut self, mapping: &str) -> Result<&mut Self, RouteError> {
        let Some(controller) = &self.controller else {
            return Err(RouteError::MissingController);
        };
        let invalid = |reason: &str| RouteError::InvalidMethodMapping {
            mapping: mapping.to_string(),
            reason: reason.to_string(),
        };

        let mut parsed = HashMap::new();
        for entry in mapping.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((methods, action)) = entry.split_once(':') else {
                return Err(invalid("expected `methods:action`"));
            };
            let action = action.trim();
            if action.is_empty() || action.contains(':') {
                return Err(invalid("expected `methods:action`"));
            }
            if !controller.has_action(action) {
                return Err(RouteError::UnknownAction {
                    action: action.to_string(),
                    controller: controller.name(),
                });
            }
            for method in methods.split(',').map(str::trim) {
                let key = if method == "*" {
                    "*".to_string()
                } else {
                    parse_method(method)?.to_string()
                };
                parsed.insert(key, action.to_string());
            }
        }
        self.method_mapping = parsed;
        Ok(self)
    }

    /// Nested router whose routes are tested only when this route's predicates match
    pub fn subrouter(&mut self) -> &mut Router {
        let conf = self.conf.clone();
        self.subrouter.get_or_insert_with(|| Router::with_conf(conf))
    }

    pub fn is_mapped(&self) -> bool {
        !self.method_mapping.is_empty()
    }

    pub fn path_template(&self) -> Option<&str> {
        self.conf.path.as_ref().map(|p| p.template())
    }

    pub fn host_template(&self) -> Option<&str> {
        self.conf.host.as_ref().map(|h| h.template())
    }

    /// Names of every variable this route captures
    pub fn var_names(&self) -> Vec<String> {
        self.conf.var_names().cloned().collect()
    }

    fn match_request<'r>(
        &'r self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        mismatch: &mut Option<Vec<Method>>,
    ) -> Option<RouteMatch<'r>> {
        let vars = self.conf.match_predicates(uri, headers)?;

        if !self.conf.accepts(method) {
            // routes with nothing to dispatch never report a mismatch
            if self.controller.is_some() || self.subrouter.is_some() {
                let allowed = mismatch.get_or_insert_with(Vec::new);
                for m in self.conf.methods.iter().flatten() {
                    if !allowed.contains(m) {
                        allowed.push(m.clone());
                    }
                }
            }
            return None;
        }
        if let Some(subrouter) = &self.subrouter {
            return subrouter.match_routes(method, uri, headers, mismatch);
        }
        let controller = self.controller.as_ref()?;
        Some(RouteMatch {
            route: self,
            controller,
            vars,
        })
    }
}

/// A successful route resolution
pub struct RouteMatch<'r> {
    pub route: &'r Route,
    pub controller: &'r Arc<dyn ErasedController>,
    /// Host, path and query variables in declaration order
    pub vars: Vec<(String, String)>,
}

impl RouteMatch<'_> {
    /// Action name for `method`: the mapped action (exact method, then `*`) or the verb
    pub fn action_for(&self, method: &Method) -> String {
        let mapping = &self.route.method_mapping;
        mapping
            .get(method.as_str())
            .or_else(|| mapping.get("*"))
            .cloned()
            .unwrap_or_else(|| method.as_str().to_string())
    }
}

/// Result of testing a request against the route table
pub enum MatchOutcome<'r> {
    Matched(RouteMatch<'r>),
    /// Some route matched everything except the method
    MethodMismatch { allowed: Vec<Method> },
    NotFound,
}

impl std::fmt::Debug for MatchOutcome<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchOutcome::Matched(m) => f
                .debug_struct("Matched")
                .field("path", &m.route.path_template())
                .field("vars", &m.vars)
                .finish(),
            MatchOutcome::MethodMismatch { allowed } => f
                .debug_struct("MethodMismatch")
                .field("allowed", allowed)
                .finish(),
            MatchOutcome::NotFound => write!(f, "NotFound"),
        }
    }
}

/// Ordered route table
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    conf: RouteConf,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_conf(conf: RouteConf) -> Self {
        Self {
            routes: Vec::new(),
            conf,
        }
    }

    /// Append an empty route that starts from this router's predicates
    pub fn new_route(&mut self) -> &mut Route {
        let conf = self.conf.clone();
        self.routes.push(Route::new(conf));
        let last = self.routes.len() - 1;
        &mut self.routes[last]
    }

    /// Route `path` to a controller
    pub fn handle(&mut self, path: &str, handler: impl IntoHandler) -> Result<&mut Route, RouteError> {
        let route = self.new_route();
        route.path(path)?;
        Ok(route.controller(handler))
    }

    /// Route `path` to a controller with a method mapping such as `"get,post:list"`
    pub fn handle_with(
        &mut self,
        path: &str,
        handler: impl IntoHandler,
        mapping: &str,
    ) -> Result<&mut Route, RouteError> {
        let route = self.new_route();
        route.path(path)?.controller(handler).method_mapping(mapping)
    }

    pub fn host(&mut self, template: &str) -> Result<&mut Route, RouteError> {
        self.new_route().host(template)
    }

    pub fn path_prefix(&mut self, template: &str) -> Result<&mut Route, RouteError> {
        self.new_route().path_prefix(template)
    }

    pub fn queries(&mut self, pairs: &[(&str, &str)]) -> Result<&mut Route, RouteError> {
        self.new_route().queries(pairs)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// First route, in registration order, whose predicates and method all match
    pub fn match_request(&self, method: &Method, uri: &Uri, headers: &HeaderMap) -> MatchOutcome<'_> {
        let mut mismatch = None;
        match self.match_routes(method, uri, headers, &mut mismatch) {
            Some(found) => MatchOutcome::Matched(found),
            None => match mismatch {
                Some(allowed) => MatchOutcome::MethodMismatch { allowed },
                None => MatchOutcome::NotFound,
            },
        }
    }

    fn match_routes<'r>(
        &'r self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        mismatch: &mut Option<Vec<Method>>,
    ) -> Option<RouteMatch<'r>> {
        self.routes
            .iter()
            .find_map(|route| route.match_request(method, uri, headers, mismatch))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;

    use super::*;
    use crate::core::{
        context::RequestContext,
        controller::{ActionResult, Controller, Handler},
    };

    #[derive(Clone, Default)]
    struct Users;
    impl Controller for Users {}

    #[derive(Clone, Default)]
    struct Api;
    impl Controller for Api {
        fn actions() -> &'static [&'static str] {
            &["list", "update"]
        }
    }

    fn get(uri: &str) -> (Method, Uri, HeaderMap) {
        (Method::GET, uri.parse().unwrap(), HeaderMap::new())
    }

    fn matched_path(outcome: MatchOutcome<'_>) -> Option<String> {
        match outcome {
            MatchOutcome::Matched(m) => m.route.path_template().map(str::to_string),
            _ => None,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let mut router = Router::new();
        router.handle("/users/{id}", Users).unwrap();
        router.handle("/users/{name:[a-z]+}", Users).unwrap();

        let (m, u, h) = get("/users/bob");
        assert_eq!(
            matched_path(router.match_request(&m, &u, &h)).as_deref(),
            Some("/users/{id}")
        );
    }

    #[test]
    fn test_method_mismatch_is_distinct() {
        let mut router = Router::new();
        router.handle("/items", Users).unwrap().methods(&["post", "put"]).unwrap();

        let (m, u, h) = get("/items");
        match router.match_request(&m, &u, &h) {
            MatchOutcome::MethodMismatch { allowed } => {
                assert_eq!(allowed, vec![Method::POST, Method::PUT]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        let (m, u, h) = get("/missing");
        assert!(matches!(router.match_request(&m, &u, &h), MatchOutcome::NotFound));
    }

    #[test]
    fn test_later_full_match_clears_mismatch() {
        let mut router = Router::new();
        router.handle("/items", Users).unwrap().methods(&["POST"]).unwrap();
        router.handle("/items", Api).unwrap();

        let (m, u, h) = get("/items");
        assert!(matches!(router.match_request(&m, &u, &h), MatchOutcome::Matched(_)));
    }

    #[test]
    fn test_host_and_query_variables() {
        let mut router = Router::new();
        router
            .handle("/search", Users)
            .unwrap()
            .host("{tenant}.example.com")
            .unwrap()
            .queries(&[("page", "{page:[0-9]+}")])
            .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "acme.example.com:8080".parse().unwrap());
        let uri: Uri = "/search?q=x&page=2".parse().unwrap();
        match router.match_request(&Method::GET, &uri, &headers) {
            MatchOutcome::Matched(m) => assert_eq!(
                m.vars,
                vec![
                    ("tenant".to_string(), "acme".to_string()),
                    ("page".to_string(), "2".to_string())
                ]
            ),
            other => panic!("expected match, got {other:?}"),
        }

        let uri: Uri = "/search?page=two".parse().unwrap();
        assert!(matches!(
            router.match_request(&Method::GET, &uri, &headers),
            MatchOutcome::NotFound
        ));
    }

    #[test]
    fn test_subrouter_inherits_copy() {
        let mut router = Router::new();
        let api = router.path_prefix("/api/{version}").unwrap().subrouter();
        api.handle("/users/{id}", Users).unwrap();
        api.handle("/posts", Api).unwrap();

        let (m, u, h) = get("/api/v1/users/9");
        match router.match_request(&m, &u, &h) {
            MatchOutcome::Matched(m) => {
                assert_eq!(m.route.path_template(), Some("/api/{version}/users/{id}"));
                assert_eq!(
                    m.vars,
                    vec![
                        ("version".to_string(), "v1".to_string()),
                        ("id".to_string(), "9".to_string())
                    ]
                );
            }
            other => panic!("expected match, got {other:?}"),
        }

        // the parent keeps its own prefix template
        assert_eq!(router.routes()[0].path_template(), Some("/api/{version}"));
        let (m, u, h) = get("/users/9");
        assert!(matches!(router.match_request(&m, &u, &h), MatchOutcome::NotFound));
    }

    #[test]
    fn test_parent_methods_apply_after_subrouter_creation() {
        let mut router = Router::new();
        let admin = router.path_prefix("/admin").unwrap();
        admin.subrouter().handle("/users", Users).unwrap();
        admin.methods(&["POST"]).unwrap();

        let (m, u, h) = get("/admin/users");
        match router.match_request(&m, &u, &h) {
            MatchOutcome::MethodMismatch { allowed } => assert_eq!(allowed, vec![Method::POST]),
            other => panic!("expected mismatch, got {other:?}"),
        }

        let uri: Uri = "/admin/users".parse().unwrap();
        assert_eq!(
            matched_path(router.match_request(&Method::POST, &uri, &HeaderMap::new())).as_deref(),
            Some("/admin/users")
        );
    }

    #[test]
    fn test_duplicate_variables_rejected_across_levels() {
        let mut router = Router::new();
        let sub = router.host("{id}.example.com").unwrap().subrouter();
        assert!(matches!(
            sub.handle("/users/{id}", Users),
            Err(RouteError::DuplicateVariable { .. })
        ));

        let mut router = Router::new();
        let sub = router.path_prefix("/orgs/{org}").unwrap().subrouter();
        assert!(matches!(
            sub.handle("/teams/{org}", Users),
            Err(RouteError::DuplicateVariable { .. })
        ));

        let mut router = Router::new();
        let route = router.handle("/p/{page}", Users).unwrap();
        assert!(matches!(
            route.queries(&[("page", "{page}")]),
            Err(RouteError::DuplicateVariable { .. })
        ));
    }

    #[test]
    fn test_method_mapping() {
        fn custom<'a>(_c: &'a mut Users, _ctx: &'a mut RequestContext) -> BoxFuture<'a, ActionResult> {
            Box::pin(async { Ok(()) })
        }

        let mut router = Router::new();
        router
            .handle_with("/api", Api, "get,post:list;put:update")
            .unwrap();
        router
            .handle_with("/custom", Handler::new(Users).action("custom", custom), "*:custom")
            .unwrap();

        let uri: Uri = "/api".parse().unwrap();
        let headers = HeaderMap::new();
        let MatchOutcome::Matched(m) = router.match_request(&Method::PUT, &uri, &headers) else {
            panic!("expected match");
        };
        assert!(m.route.is_mapped());
        assert_eq!(m.action_for(&Method::PUT), "update");
        assert_eq!(m.action_for(&Method::POST), "list");
        assert_eq!(m.action_for(&Method::DELETE), "DELETE");

        let uri: Uri = "/custom".parse().unwrap();
        let MatchOutcome::Matched(m) = router.match_request(&Method::PATCH, &uri, &headers) else {
            panic!("expected match");
        };
        assert_eq!(m.action_for(&Method::PATCH), "custom");
    }

    #[test]
    fn test_method_mapping_errors() {
        let mut router = Router::new();
        assert!(matches!(
            router.handle_with("/a", Api, "get"),
            Err(RouteError::InvalidMethodMapping { .. })
        ));
        assert!(matches!(
            router.handle_with("/b", Api, "fetch:list"),
            Err(RouteError::UnknownMethod(_))
        ));
        assert!(matches!(
            router.handle_with("/c", Api, "get:missing"),
            Err(RouteError::UnknownAction { .. })
        ));
        assert!(matches!(
            router.new_route().method_mapping("get:list"),
            Err(RouteError::MissingController)
        ));
        assert!(matches!(
            router.handle("relative", Users),
            Err(RouteError::NotAbsolute { .. })
        ));
    }
}
