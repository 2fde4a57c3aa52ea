//! Pattern router: `(method, path-pattern)` registration and first-match
//! dispatch.
//!
//! Pattern grammar: `/` matches only the root; otherwise each non-empty
//! segment is a literal, a `:name` parameter binding exactly one segment, or
//! a trailing `*` wildcard swallowing the rest of the path (`*name` binds
//! it). Patterns compile to anchored regular expressions at registration.

use crate::http::{not_found, Method, Request, Response};
use regex::Regex;
use std::sync::Arc;

pub type RouteHandler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

pub struct Route {
    pub method: Method,
    pub pattern: String,
    regex: Regex,
    param_names: Vec<String>,
    handler: RouteHandler,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Register a route. Routes are tried in registration order; the first
    /// match wins. There is no deregistration.
    pub fn register<H>(&mut self, method: Method, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register_arc(method, pattern, Arc::new(handler));
    }

    pub fn register_arc(&mut self, method: Method, pattern: &str, handler: RouteHandler) {
        let (regex_str, param_names) = compile_pattern(pattern);
        let regex = Regex::new(&regex_str).expect("generated route pattern is valid");

        self.routes.push(Route {
            method,
            pattern: pattern.to_string(),
            regex,
            param_names,
            handler,
        });
    }

    /// Dispatch to the first matching route, injecting path parameters.
    /// Method mismatch skips the route; no match at all is 404.
    pub fn dispatch(&self, mut request: Request) -> Response {
        for route in &self.routes {
            if route.method != request.method {
                continue;
            }
            if let Some(caps) = route.regex.captures(&request.path) {
                for (i, name) in route.param_names.iter().enumerate() {
                    let value = caps.get(i + 1).map(|m| m.as_str()).unwrap_or("");
                    request.path_params.insert(name.clone(), value.to_string());
                }
                return (route.handler)(&request);
            }
        }
        not_found("Route not found")
    }

    pub fn has_route(&self, method: Method, path: &str) -> bool {
        self.routes
            .iter()
            .any(|r| r.method == method && r.regex.is_match(path))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get<H>(&mut self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register(Method::Get, pattern, handler);
    }

    pub fn post<H>(&mut self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register(Method::Post, pattern, handler);
    }

    pub fn put<H>(&mut self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register(Method::Put, pattern, handler);
    }

    pub fn delete<H>(&mut self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register(Method::Delete, pattern, handler);
    }

    pub fn patch<H>(&mut self, pattern: &str, handler: H)
    where
        H: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.register(Method::Patch, pattern, handler);
    }
}

/// Compile a pattern into an anchored regex plus its parameter names in
/// declaration order.
fn compile_pattern(pattern: &str) -> (String, Vec<String>) {
    if pattern == "/" {
        return ("^/$".to_string(), Vec::new());
    }

    let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = String::from("^");
    let mut names = Vec::new();

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;

        if let Some(name) = segment.strip_prefix(':') {
            names.push(name.to_string());
            out.push_str("/([^/]+)");
        } else if last && segment.starts_with('*') {
            // Trailing wildcard: matches the bare prefix and any descendant.
            let name = &segment[1..];
            if !name.is_empty() {
                names.push(name.to_string());
            }
            out.push_str("(?:/(.*))?");
        } else {
            out.push('/');
            out.push_str(&regex::escape(segment));
        }
    }

    out.push('$');
    (out, names)
}
