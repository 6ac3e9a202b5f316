//! Route patterns and matching.
//!
//! A [`Route`] is an ordered set of predicates over a request: method, path
//! segments, query items, headers, and optionally the buffered body. Routes
//! parse from strings:
//!
//! ```
//! use tern::Route;
//!
//! let route: Route = "GET /hello/:name/*?time=*".parse().unwrap();
//! ```
//!
//! * a leading token before the first space is the method (`*` for any);
//! * `:name` captures one path segment under `name`;
//! * `*` matches any one segment, except as the final segment where it
//!   matches the whole remaining path (zero or more segments);
//! * query items after `?` must be present, with `*` accepting any value.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::http::{Method, Request};

/// One parsed path segment of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    WildcardOne,
    WildcardRest,
    Capture(String),
}

/// A value predicate for query items and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValuePattern {
    Any,
    Exact(String),
}

impl ValuePattern {
    fn matches(&self, value: &str) -> bool {
        match self {
            ValuePattern::Any => true,
            ValuePattern::Exact(expected) => expected == value,
        }
    }

    fn matches_ignore_case(&self, value: &str) -> bool {
        match self {
            ValuePattern::Any => true,
            ValuePattern::Exact(expected) => expected.eq_ignore_ascii_case(value),
        }
    }
}

impl From<&str> for ValuePattern {
    fn from(s: &str) -> ValuePattern {
        if s == "*" {
            ValuePattern::Any
        } else {
            ValuePattern::Exact(s.to_string())
        }
    }
}

/// A predicate over the buffered request body.
pub type BodyPredicate = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A request predicate plus capture bookkeeping.
#[derive(Clone)]
pub struct Route {
    /// `None` matches any method.
    method: Option<Method>,
    segments: Vec<Segment>,
    query: Vec<(String, ValuePattern)>,
    headers: Vec<(String, ValuePattern)>,
    body: Option<BodyPredicate>,
    /// Capture names mapped to their segment index.
    path_parameters: Vec<(String, usize)>,
}

/// Error parsing a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParseError;

impl fmt::Display for RouteParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("malformed route pattern")
    }
}

impl std::error::Error for RouteParseError {}

impl FromStr for Route {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Route, RouteParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RouteParseError);
        }

        let (method, target) = match s.split_once(' ') {
            Some((method, target)) => {
                let method = match method {
                    "*" => None,
                    name => Some(Method::from_str(name).unwrap()),
                };
                (method, target.trim())
            }
            None => (None, s),
        };
        if target.is_empty() {
            return Err(RouteParseError);
        }

        let (path, query_string) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        let raw: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut path_parameters = Vec::new();
        for (index, part) in raw.iter().enumerate() {
            let segment = if *part == "*" {
                if index + 1 == raw.len() {
                    Segment::WildcardRest
                } else {
                    Segment::WildcardOne
                }
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(RouteParseError);
                }
                path_parameters.push((name.to_string(), index));
                Segment::Capture(name.to_string())
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        let mut query = Vec::new();
        if let Some(query_string) = query_string {
            for item in query_string.split('&').filter(|s| !s.is_empty()) {
                match item.split_once('=') {
                    Some((name, value)) => query.push((name.to_string(), ValuePattern::from(value))),
                    None => query.push((item.to_string(), ValuePattern::Any)),
                }
            }
        }

        Ok(Route {
            method,
            segments,
            query,
            headers: Vec::new(),
            body: None,
            path_parameters,
        })
    }
}

impl Route {
    /// Requires `name` to be present with a value matching `pattern`
    /// (`"*"` accepts any value).
    pub fn with_header(mut self, name: impl Into<String>, pattern: &str) -> Route {
        self.headers.push((name.into(), ValuePattern::from(pattern)));
        self
    }

    /// Requires the buffered request body to satisfy `predicate`.
    pub fn with_body(mut self, predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Route {
        self.body = Some(Arc::new(predicate));
        self
    }

    /// Capture names in pattern order, paired with their segment index.
    pub fn path_parameters(&self) -> &[(String, usize)] {
        &self.path_parameters
    }

    /// Tests every predicate against `request`; on a match, returns the
    /// captured path parameters in capture order.
    pub fn matches(&self, request: &Request) -> Option<Vec<(String, String)>> {
        if let Some(method) = &self.method {
            if method != &request.method {
                return None;
            }
        }

        let parts: Vec<&str> = request.path.split('/').filter(|s| !s.is_empty()).collect();
        let mut captures = Vec::new();
        let mut index = 0;
        for segment in &self.segments {
            match segment {
                Segment::WildcardRest => {
                    index = parts.len();
                    break;
                }
                Segment::Literal(expected) => {
                    if parts.get(index).map(|p| *p == expected.as_str()) != Some(true) {
                        return None;
                    }
                }
                Segment::WildcardOne => {
                    if index >= parts.len() {
                        return None;
                    }
                }
                Segment::Capture(name) => match parts.get(index) {
                    Some(part) => captures.push((name.clone(), (*part).to_string())),
                    None => return None,
                },
            }
            index += 1;
        }
        if index != parts.len() {
            return None;
        }

        for (name, pattern) in &self.query {
            match request.query_value(name) {
                Some(value) if pattern.matches(value) => {}
                _ => return None,
            }
        }

        for (name, pattern) in &self.headers {
            match request.headers.get(name) {
                Some(value) if pattern.matches_ignore_case(value) => {}
                _ => return None,
            }
        }

        if let Some(predicate) = &self.body {
            if !predicate(&request.body) {
                return None;
            }
        }

        Some(captures)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("segments", &self.segments)
            .field("query", &self.query)
            .field("headers", &self.headers)
            .field("body", &self.body.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn request(method: Method, target: &str) -> Request {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let mut request = Request::new(method, path);
        for item in query.split('&').filter(|s| !s.is_empty()) {
            let (name, value) = item.split_once('=').unwrap_or((item, ""));
            request.query.push((name.to_string(), value.to_string()));
        }
        request
    }

    #[test]
    fn wildcard_one_matches_exactly_one_segment() {
        let route: Route = "GET /hello/*/world".parse().unwrap();
        assert!(route
            .matches(&request(Method::Get, "/hello/fish/world"))
            .is_some());
        assert!(route
            .matches(&request(Method::Get, "/hello/fish/sea"))
            .is_none());
        assert!(route.matches(&request(Method::Get, "/hello/world")).is_none());
    }

    #[test]
    fn trailing_wildcard_matches_rest() {
        let route: Route = "/hello/*".parse().unwrap();
        assert!(route.matches(&request(Method::Get, "/hello/a/b/c")).is_some());
        assert!(route.matches(&request(Method::Get, "/hello")).is_some());
        assert!(route.matches(&request(Method::Get, "/goodbye/a")).is_none());
    }

    #[test]
    fn query_predicates() {
        let route: Route = "/hello?time=*".parse().unwrap();
        assert!(route
            .matches(&request(Method::Get, "/hello?time=morning"))
            .is_some());
        assert!(route
            .matches(&request(Method::Get, "/hello?count=1&time=morning"))
            .is_some());
        assert!(route.matches(&request(Method::Get, "/hello")).is_none());
    }

    #[test]
    fn method_predicate() {
        let route: Route = "POST /submit".parse().unwrap();
        assert!(route.matches(&request(Method::Post, "/submit")).is_some());
        assert!(route.matches(&request(Method::Get, "/submit")).is_none());

        let any: Route = "* /submit".parse().unwrap();
        assert!(any.matches(&request(Method::Get, "/submit")).is_some());
    }

    #[test]
    fn captures_bind_segment_values() {
        let route: Route = "GET /books/:id/pages/:page".parse().unwrap();
        let captures = route
            .matches(&request(Method::Get, "/books/42/pages/7"))
            .unwrap();
        assert_eq!(
            captures,
            vec![
                ("id".to_string(), "42".to_string()),
                ("page".to_string(), "7".to_string())
            ]
        );
        assert_eq!(
            route.path_parameters().to_vec(),
            vec![("id".to_string(), 1), ("page".to_string(), 3)]
        );
    }

    #[test]
    fn header_predicates_ignore_name_case() {
        let route = "GET /".parse::<Route>().unwrap().with_header("X-Token", "*");
        let mut with = request(Method::Get, "/");
        with.headers.append("x-token", "abc");
        assert!(route.matches(&with).is_some());
        assert!(route.matches(&request(Method::Get, "/")).is_none());
    }

    #[test]
    fn body_predicate_forces_inspection() {
        let route = "POST /data"
            .parse::<Route>()
            .unwrap()
            .with_body(|body| body.starts_with(b"{"));
        let mut json = request(Method::Post, "/data");
        json.body = b"{\"ok\":true}".to_vec();
        assert!(route.matches(&json).is_some());

        let mut text = request(Method::Post, "/data");
        text.body = b"plain".to_vec();
        assert!(route.matches(&text).is_none());
    }
}
