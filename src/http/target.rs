use serde::{Deserialize, Serialize};

use crate::core::error::{EngineError, Result};

/// Reserved parameter key marking URI-path injection: the payload lands at
/// the `*` marker inside the URL path instead of a named parameter.
pub const URI_SENTINEL_KEY: &str = "#1*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ParamLocation {
    Get,
    Post,
    Header,
    Cookie,
    Uri,
    Json,
    Xml,
    Multipart,
}

impl ParamLocation {
    pub fn label(&self) -> &'static str {
        match self {
            ParamLocation::Get => "GET",
            ParamLocation::Post => "POST",
            ParamLocation::Header => "HEADER",
            ParamLocation::Cookie => "COOKIE",
            ParamLocation::Uri => "URI",
            ParamLocation::Json => "JSON",
            ParamLocation::Xml => "XML",
            ParamLocation::Multipart => "MULTIPART",
        }
    }

    /// Percent-encoding applies only to form-shaped carriers.
    fn encodes(&self) -> bool {
        matches!(self, ParamLocation::Get | ParamLocation::Post | ParamLocation::Cookie)
    }
}

/// One injection point. Immutable; `key` uniquely identifies it within a
/// request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: String,
    pub location: ParamLocation,
    pub is_injected: bool,
}

impl Parameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>, location: ParamLocation) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(EngineError::Config("parameter key cannot be empty".into()));
        }
        if key == URI_SENTINEL_KEY && location != ParamLocation::Uri {
            return Err(EngineError::Config(format!(
                "parameter key '{}' is reserved for URI-path injection",
                URI_SENTINEL_KEY
            )));
        }
        Ok(Self { key, value: value.into(), location, is_injected: false })
    }

    /// Stable serialized form used as session key material.
    pub fn serialized(&self) -> String {
        serde_json::to_string(self).expect("parameter serializes")
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.location.label(), self.key)
    }
}

/// Fully prepared wire request, ready for the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// An endpoint + parameter under test. Immutable once built.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: String,
    pub method: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub parameter: Parameter,
    pub is_json: bool,
    pub is_xml: bool,
    pub is_multipart: bool,
    pub skip_urlencoding: bool,
    /// Whether cookie payloads get percent-encoded; set once per scan after
    /// the interactive choice (defaults to yes).
    pub encode_cookie: bool,
}

impl Target {
    pub fn new(url: impl Into<String>, method: impl Into<String>, parameter: Parameter) -> Result<Self> {
        let url = url.into();
        if parameter.location == ParamLocation::Uri && !url.contains('*') {
            return Err(EngineError::Config(
                "URI-path injection requires a '*' marker in the URL".into(),
            ));
        }
        Ok(Self {
            url,
            method: method.into(),
            body: String::new(),
            headers: Vec::new(),
            parameter,
            is_json: false,
            is_xml: false,
            is_multipart: false,
            skip_urlencoding: false,
            encode_cookie: true,
        })
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_flags(mut self, is_json: bool, is_xml: bool, is_multipart: bool) -> Self {
        self.is_json = is_json;
        self.is_xml = is_xml;
        self.is_multipart = is_multipart;
        self
    }

    pub fn with_skip_urlencoding(mut self, skip: bool) -> Self {
        self.skip_urlencoding = skip;
        self
    }

    /// Endpoint path component, the session-record key.
    pub fn endpoint_path(&self) -> String {
        let stripped = self
            .url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let after_host = stripped.find('/').map(|i| &stripped[i..]).unwrap_or("/");
        after_host.split('?').next().unwrap_or("/").replace('*', "")
    }

    /// Build the wire request. `expression` is the rendered payload to append
    /// to the parameter's original value; `None` sends the request unmodified
    /// (connection test), with any `*` markers stripped.
    pub fn prepare(&self, expression: Option<&str>) -> PreparedRequest {
        let mut url = self.url.clone();
        let mut body = self.body.clone();
        let mut headers = self.headers.clone();

        match expression {
            None => {
                url = url.replace('*', "");
                body = body.replace('*', "");
            }
            Some(expr) => {
                let encoded = self.encoded_expression(expr);
                match self.parameter.location {
                    ParamLocation::Uri => {
                        url = url.replacen('*', &encoded, 1);
                    }
                    ParamLocation::Get => {
                        url = inject_form_pair(&url, &self.parameter, &encoded, true);
                    }
                    ParamLocation::Post => {
                        body = inject_form_pair(&body, &self.parameter, &encoded, false);
                    }
                    ParamLocation::Json => {
                        body = inject_json(&body, &self.parameter.key, expr);
                    }
                    ParamLocation::Xml => {
                        body = inject_xml(&body, &self.parameter, expr);
                    }
                    ParamLocation::Multipart => {
                        body = inject_multipart(&body, &self.parameter, expr);
                    }
                    ParamLocation::Header => {
                        set_header(
                            &mut headers,
                            &self.parameter.key,
                            &format!("{}{}", self.parameter.value, expr),
                        );
                    }
                    ParamLocation::Cookie => {
                        let cookie_expr = if self.encode_cookie && !self.skip_urlencoding {
                            urlencoding::encode(expr).into_owned()
                        } else {
                            expr.to_string()
                        };
                        inject_cookie(&mut headers, &self.parameter, &cookie_expr);
                    }
                }
            }
        }

        PreparedRequest {
            url,
            method: self.method.clone(),
            headers,
            body: if body.is_empty() { None } else { Some(body) },
        }
    }

    fn encoded_expression(&self, expr: &str) -> String {
        if self.parameter.location.encodes() && !self.skip_urlencoding {
            urlencoding::encode(expr).into_owned()
        } else {
            expr.to_string()
        }
    }
}

/// Rewrite `key=value` inside a query string or form body, appending the
/// payload to the original value. For URLs only the part after `?` is touched.
fn inject_form_pair(carrier: &str, param: &Parameter, encoded_expr: &str, is_url: bool) -> String {
    let (head, pairs_str) = if is_url {
        match carrier.find('?') {
            Some(i) => (&carrier[..=i], &carrier[i + 1..]),
            None => (carrier, ""),
        }
    } else {
        ("", carrier)
    };

    let rebuilt: Vec<String> = pairs_str
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = match pair.find('=') {
                Some(i) => (&pair[..i], &pair[i + 1..]),
                None => (pair, ""),
            };
            if k == param.key {
                format!("{}={}{}", k, v.replace('*', ""), encoded_expr)
            } else {
                pair.to_string()
            }
        })
        .collect();

    format!("{}{}", head, rebuilt.join("&"))
}

/// Set a JSON string value for `key` anywhere in the document, appending the
/// raw payload. Falls back to the original body if it is not valid JSON.
fn inject_json(body: &str, key: &str, expr: &str) -> String {
    let Ok(mut doc) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    fn walk(value: &mut serde_json::Value, key: &str, expr: &str) -> bool {
        match value {
            serde_json::Value::Object(map) => {
                if let Some(entry) = map.get_mut(key) {
                    let original = match entry {
                        serde_json::Value::String(s) => s.clone(),
                        ref other => other.to_string(),
                    };
                    *entry = serde_json::Value::String(format!("{}{}", original, expr));
                    return true;
                }
                map.values_mut().any(|v| walk(v, key, expr))
            }
            serde_json::Value::Array(items) => items.iter_mut().any(|v| walk(v, key, expr)),
            _ => false,
        }
    }
    walk(&mut doc, key, expr);
    doc.to_string()
}

fn inject_xml(body: &str, param: &Parameter, expr: &str) -> String {
    let open = format!("<{}>", param.key);
    let close = format!("</{}>", param.key);
    if let (Some(start), Some(end)) = (body.find(&open), body.find(&close)) {
        if start + open.len() <= end {
            let mut out = String::with_capacity(body.len() + expr.len());
            out.push_str(&body[..start + open.len()]);
            out.push_str(&body[start + open.len()..end]);
            out.push_str(expr);
            out.push_str(&body[end..]);
            return out;
        }
    }
    body.to_string()
}

/// Append the payload to the form-data part named after the parameter.
fn inject_multipart(body: &str, param: &Parameter, expr: &str) -> String {
    let marker = format!("name=\"{}\"", param.key);
    let Some(name_at) = body.find(&marker) else {
        return body.to_string();
    };
    // part value begins after the blank line following the part headers
    let after = &body[name_at..];
    let value_at = match after.find("\r\n\r\n") {
        Some(i) => name_at + i + 4,
        None => match after.find("\n\n") {
            Some(i) => name_at + i + 2,
            None => return body.to_string(),
        },
    };
    let value_end = body[value_at..]
        .find(['\r', '\n'])
        .map(|i| value_at + i)
        .unwrap_or(body.len());
    let mut out = String::with_capacity(body.len() + expr.len());
    out.push_str(&body[..value_end]);
    out.push_str(expr);
    out.push_str(&body[value_end..]);
    out
}

fn set_header(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case(key) {
            *v = value.to_string();
            return;
        }
    }
    headers.push((key.to_string(), value.to_string()));
}

fn inject_cookie(headers: &mut Vec<(String, String)>, param: &Parameter, expr: &str) {
    for (k, v) in headers.iter_mut() {
        if k.eq_ignore_ascii_case("cookie") {
            let rebuilt: Vec<String> = v
                .split(';')
                .map(|pair| {
                    let trimmed = pair.trim();
                    match trimmed.find('=') {
                        Some(i) if &trimmed[..i] == param.key => {
                            format!("{}={}{}", &trimmed[..i], &trimmed[i + 1..], expr)
                        }
                        _ => trimmed.to_string(),
                    }
                })
                .collect();
            *v = rebuilt.join("; ");
            return;
        }
    }
    headers.push(("Cookie".to_string(), format!("{}={}{}", param.key, param.value, expr)));
}

/// A raw HTTP request loaded from a file (Burp/ZAP export style).
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
    pub body: String,
    pub url: String,
}

impl RawRequest {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| EngineError::Config("empty request file".into()))?;
        let mut parts = request_line.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| EngineError::Config("invalid request line".into()))?
            .to_string();
        let path = parts
            .next()
            .ok_or_else(|| EngineError::Config("invalid request line".into()))?
            .to_string();

        let mut headers = Vec::new();
        let mut cookies = Vec::new();
        let mut body = String::new();
        let mut in_body = false;
        for line in lines {
            if in_body {
                if !body.is_empty() {
                    body.push('\n');
                }
                body.push_str(line);
            } else if line.is_empty() {
                in_body = true;
            } else if let Some(i) = line.find(':') {
                let key = line[..i].trim().to_string();
                let value = line[i + 1..].trim().to_string();
                if key.eq_ignore_ascii_case("cookie") {
                    for pair in value.split(';') {
                        let pair = pair.trim();
                        if let Some(j) = pair.find('=') {
                            cookies.push((pair[..j].to_string(), pair[j + 1..].to_string()));
                        }
                    }
                }
                headers.push((key, value));
            }
        }

        let host = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("host"))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| EngineError::Config("request file has no Host header".into()))?;
        let scheme = if headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("referer") && v.starts_with("https"))
        {
            "https"
        } else {
            "http"
        };
        let url = format!("{}://{}{}", scheme, host, path);

        Ok(Self { method, path, headers, cookies, body, url })
    }

    pub fn is_json(&self) -> bool {
        self.content_type_contains("application/json")
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type_contains("multipart/form-data")
    }

    pub fn is_xml(&self) -> bool {
        self.content_type_contains("xml")
    }

    fn content_type_contains(&self, needle: &str) -> bool {
        self.headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.contains(needle))
    }

    /// Enumerate testable injection points: query, body and cookie
    /// parameters, plus the URI marker when present.
    pub fn injection_points(&self) -> Vec<Parameter> {
        let mut points = Vec::new();

        if self.path.contains('*') {
            points.push(Parameter {
                key: URI_SENTINEL_KEY.to_string(),
                value: String::new(),
                location: ParamLocation::Uri,
                is_injected: false,
            });
        }
        if let Some(q) = self.path.split('?').nth(1) {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                if let Ok(p) = Parameter::new(k, v, ParamLocation::Get) {
                    points.push(p);
                }
            }
        }
        if !self.body.is_empty() {
            let location = if self.is_json() {
                ParamLocation::Json
            } else if self.is_multipart() {
                ParamLocation::Multipart
            } else if self.is_xml() {
                ParamLocation::Xml
            } else {
                ParamLocation::Post
            };
            if location == ParamLocation::Post {
                for pair in self.body.split('&').filter(|p| !p.is_empty()) {
                    let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                    if let Ok(p) = Parameter::new(k, v, location) {
                        points.push(p);
                    }
                }
            } else if location == ParamLocation::Json {
                if let Ok(serde_json::Value::Object(map)) =
                    serde_json::from_str::<serde_json::Value>(&self.body)
                {
                    for (k, v) in map {
                        let value = match v {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        if let Ok(p) = Parameter::new(k, value, location) {
                            points.push(p);
                        }
                    }
                }
            }
        }
        for (k, v) in &self.cookies {
            if let Ok(p) = Parameter::new(k.clone(), v.clone(), ParamLocation::Cookie) {
                points.push(p);
            }
        }
        points
    }

    /// Build a [`Target`] testing one of this request's parameters.
    pub fn target_for(&self, parameter: Parameter) -> Result<Target> {
        let headers: Vec<(String, String)> = self
            .headers
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("content-length"))
            .cloned()
            .collect();
        Ok(Target::new(self.url.clone(), self.method.clone(), parameter)?
            .with_body(self.body.clone())
            .with_headers(headers)
            .with_flags(self.is_json(), self.is_xml(), self.is_multipart()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_target(url: &str) -> Target {
        let param = Parameter::new("id", "1", ParamLocation::Get).unwrap();
        Target::new(url, "GET", param).unwrap()
    }

    #[test]
    fn get_payload_is_appended_and_encoded() {
        let target = get_target("http://example.com/vuln.php?id=1&name=x");
        let prepared = target.prepare(Some(" AND 1=1"));
        assert_eq!(prepared.url, "http://example.com/vuln.php?id=1%20AND%201%3D1&name=x");
    }

    #[test]
    fn skip_urlencoding_sends_raw_payload() {
        let target = get_target("http://example.com/vuln.php?id=1").with_skip_urlencoding(true);
        let prepared = target.prepare(Some(" AND 1=1"));
        assert_eq!(prepared.url, "http://example.com/vuln.php?id=1 AND 1=1");
    }

    #[test]
    fn connection_test_strips_markers() {
        let param = Parameter {
            key: URI_SENTINEL_KEY.to_string(),
            value: String::new(),
            location: ParamLocation::Uri,
            is_injected: false,
        };
        let target = Target::new("http://example.com/user/1*/view", "GET", param).unwrap();
        let prepared = target.prepare(None);
        assert_eq!(prepared.url, "http://example.com/user/1/view");
    }

    #[test]
    fn uri_marker_receives_payload() {
        let param = Parameter {
            key: URI_SENTINEL_KEY.to_string(),
            value: String::new(),
            location: ParamLocation::Uri,
            is_injected: false,
        };
        let target = Target::new("http://example.com/user/1*/view", "GET", param).unwrap();
        let prepared = target.prepare(Some("'--"));
        assert_eq!(prepared.url, "http://example.com/user/1'--/view");
    }

    #[test]
    fn sentinel_key_rejected_outside_uri() {
        assert!(Parameter::new(URI_SENTINEL_KEY, "", ParamLocation::Get).is_err());
    }

    #[test]
    fn json_value_receives_payload() {
        let param = Parameter::new("name", "bob", ParamLocation::Json).unwrap();
        let target = Target::new("http://example.com/api", "POST", param)
            .unwrap()
            .with_body(r#"{"name":"bob","age":3}"#)
            .with_flags(true, false, false);
        let prepared = target.prepare(Some("' OR '1'='1"));
        let doc: serde_json::Value = serde_json::from_str(prepared.body.as_deref().unwrap()).unwrap();
        assert_eq!(doc["name"], "bob' OR '1'='1");
    }

    #[test]
    fn cookie_pair_rewritten_in_place() {
        let param = Parameter::new("session", "abc", ParamLocation::Cookie).unwrap();
        let target = Target::new("http://example.com/", "GET", param)
            .unwrap()
            .with_headers(vec![("Cookie".into(), "session=abc; theme=dark".into())]);
        let prepared = target.prepare(Some("'"));
        let cookie = &prepared.headers.iter().find(|(k, _)| k == "Cookie").unwrap().1;
        assert_eq!(cookie, "session=abc%27; theme=dark");
    }

    #[test]
    fn raw_request_roundtrip() {
        let raw = "POST /login?next=home HTTP/1.1\nHost: example.com\nContent-Type: application/x-www-form-urlencoded\nCookie: sid=1\n\nuser=admin&pass=x";
        let req = RawRequest::parse(raw).unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.url, "http://example.com/login?next=home");
        let points = req.injection_points();
        let keys: Vec<&str> = points.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["next", "user", "pass", "sid"]);
    }

    #[test]
    fn endpoint_path_drops_query_and_markers() {
        let target = get_target("http://example.com/vuln.php?id=1");
        assert_eq!(target.endpoint_path(), "/vuln.php");
    }
}
