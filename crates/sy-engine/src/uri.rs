//! Endpoint URI parsing and normalisation
//!
//! Accepts `scheme:path?k=v&...` and `scheme://path?k=v&...`. Query keys and
//! values are percent-decoded, as is the path. The normalised form is
//! `scheme://path?k1=v1&k2=v2` with a lower-case scheme and sorted keys, so
//! two spellings of the same endpoint share one registry entry. Parsing the
//! normalised form yields the same uri.

use std::collections::BTreeMap;
use std::fmt;

use sy_common::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUri {
    scheme: String,
    path: String,
    params: BTreeMap<String, String>,
}

impl EndpointUri {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| EngineError::configuration(format!("endpoint uri '{}' has no scheme", raw)))?;

        let scheme = scheme.trim().to_ascii_lowercase();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+' || c == '.') {
            return Err(EngineError::configuration(format!(
                "endpoint uri '{}' has an invalid scheme",
                raw
            )));
        }

        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let (path, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let key = decode(key, raw)?;
                let value = decode(value, raw)?;
                if key.is_empty() {
                    return Err(EngineError::configuration(format!(
                        "endpoint uri '{}' has an empty parameter name",
                        raw
                    )));
                }
                if params.insert(key.clone(), value).is_some() {
                    return Err(EngineError::configuration(format!(
                        "endpoint uri '{}' repeats parameter '{}'",
                        raw, key
                    )));
                }
            }
        }

        Ok(Self {
            scheme,
            path: decode(path, raw)?,
            params,
        })
    }

    /// Parse and merge an explicit parameter map. A key given both ways is an error.
    pub fn parse_with<I, K, V>(raw: &str, extra: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut uri = Self::parse(raw)?;
        for (key, value) in extra {
            let key = key.into();
            if uri.params.insert(key.clone(), value.into()).is_some() {
                return Err(EngineError::configuration(format!(
                    "parameter '{}' given both in '{}' and in the parameter map",
                    key, raw
                )));
            }
        }
        Ok(uri)
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The component-specific remainder, e.g. a queue name or `host:port/path`
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn into_params(self) -> BTreeMap<String, String> {
        self.params
    }

    pub fn normalized(&self) -> String {
        let mut out = format!("{}://{}", self.scheme, encode_path(&self.path));
        if !self.params.is_empty() {
            let query: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            out.push('?');
            out.push_str(&query.join("&"));
        }
        out
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

/// Percent-encode a decoded path. Separators such as `/`, `:` and `@` stay
/// literal so `host:port/path` remains readable.
fn encode_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut buf = [0u8; 4];
    for c in path.chars() {
        if c.is_ascii_alphanumeric() || "-._~/:@!$&'()*+,;=".contains(c) {
            out.push(c);
        } else {
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
        }
    }
    out
}

fn decode(part: &str, raw: &str) -> Result<String> {
    // `+` is a literal in endpoint uris, not an encoded space
    urlencoding::decode(part)
        .map(|s| s.into_owned())
        .map_err(|e| EngineError::configuration(format!("endpoint uri '{}' is not valid utf-8: {}", raw, e)))
}
