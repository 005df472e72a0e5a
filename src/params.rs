//! Parsing of flat `key=value` job parameters.
//!
//! Tokens are split on the first `=`; everything after it is the value, so
//! `query=a=b` yields the value `a=b`. Values that look like numbers are
//! coerced to [`ParamValue::Int`] or [`ParamValue::Float`], everything else
//! stays text. Duplicate names keep the last occurrence.
//!
//! The detached launcher ships parameters across the process boundary as a
//! URL-encoded query string; [`Params::to_query`] and [`query_to_tokens`]
//! convert between the two forms.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParamError;

/// A single typed parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Coerce a raw token value. Only plain decimal literals count as numeric;
    /// words such as `inf` or `NaN` stay text.
    pub fn coerce(raw: &str) -> Self {
        if let Ok(n) = raw.parse::<i64>() {
            return ParamValue::Int(n);
        }
        if looks_numeric(raw)
            && let Ok(f) = raw.parse::<f64>()
            && f.is_finite()
        {
            return ParamValue::Float(f);
        }
        ParamValue::Text(raw.to_string())
    }
}

fn looks_numeric(raw: &str) -> bool {
    raw.chars().any(|c| c.is_ascii_digit())
        && raw
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(n) => write!(f, "{n}"),
            // `{:?}` keeps the fraction of whole floats, so they reparse as floats.
            ParamValue::Float(x) => write!(f, "{x:?}"),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

/// Name → value mapping produced by the parser.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` tokens. A token without `=` aborts the whole parse.
    pub fn parse<I, S>(tokens: I) -> Result<Self, ParamError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut params = Params::new();
        for token in tokens {
            let token = token.as_ref();
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| ParamError::MissingSeparator(token.to_string()))?;
            if name.is_empty() {
                return Err(ParamError::EmptyName(token.to_string()));
            }
            params.insert(name, ParamValue::coerce(value));
        }
        Ok(params)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0.get(name)
    }

    /// Encode as `application/x-www-form-urlencoded`.
    pub fn to_query(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.0 {
            serializer.append_pair(name, &value.to_string());
        }
        serializer.finish()
    }
}

/// Decode a URL-encoded query string into `key=value` tokens.
pub fn query_to_tokens(query: &str) -> Vec<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| format!("{name}={value}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_are_coerced() {
        let params = Params::parse(["retries=3", "name=bob", "ratio=0.5"]).unwrap();
        assert_eq!(params.get("retries"), Some(&ParamValue::Int(3)));
        assert_eq!(params.get("name"), Some(&ParamValue::Text("bob".into())));
        assert_eq!(params.get("ratio"), Some(&ParamValue::Float(0.5)));
    }

    #[test]
    fn last_occurrence_wins() {
        let params = Params::parse(["id=1", "id=2", "name=x"]).unwrap();
        assert_eq!(params.get("id"), Some(&ParamValue::Int(2)));
        assert_eq!(params, Params::parse(["name=x", "id=2"]).unwrap());
    }

    #[test]
    fn splits_on_first_separator_only() {
        let params = Params::parse(["filter=a=b"]).unwrap();
        assert_eq!(params.get("filter"), Some(&ParamValue::Text("a=b".into())));
    }

    #[test]
    fn token_without_separator_is_malformed() {
        let err = Params::parse(["name=ok", "oops"]).unwrap_err();
        assert_eq!(err, ParamError::MissingSeparator("oops".into()));
    }

    #[test]
    fn empty_name_is_malformed() {
        let err = Params::parse(["=5"]).unwrap_err();
        assert_eq!(err, ParamError::EmptyName("=5".into()));
    }

    #[test]
    fn non_numeric_words_stay_text() {
        assert_eq!(ParamValue::coerce("inf"), ParamValue::Text("inf".into()));
        assert_eq!(ParamValue::coerce("NaN"), ParamValue::Text("NaN".into()));
        assert_eq!(ParamValue::coerce(""), ParamValue::Text(String::new()));
        assert_eq!(ParamValue::coerce("-42"), ParamValue::Int(-42));
        assert_eq!(ParamValue::coerce("1e3"), ParamValue::Float(1000.0));
    }

    #[test]
    fn query_survives_the_process_boundary() {
        let params = Params::parse(["email=ada@example.com", "note=a b&c", "user_id=7"]).unwrap();
        let query = params.to_query();
        assert!(!query.contains(' '));

        let reparsed = Params::parse(query_to_tokens(&query)).unwrap();
        assert_eq!(reparsed, params);
    }

    #[test]
    fn whole_floats_stay_floats_across_the_query() {
        let params = Params::parse(["ratio=3.0", "count=3", "big=1e300"]).unwrap();
        assert_eq!(params.get("ratio").unwrap().to_string(), "3.0");

        let reparsed = Params::parse(query_to_tokens(&params.to_query())).unwrap();
        assert_eq!(reparsed.get("ratio"), Some(&ParamValue::Float(3.0)));
        assert_eq!(reparsed.get("count"), Some(&ParamValue::Int(3)));
        assert_eq!(reparsed, params);
        assert_eq!(ParamValue::coerce("1e999"), ParamValue::Text("1e999".into()));
    }

    #[test]
    fn serializes_as_plain_json_object() {
        let params = Params::parse(["user_id=7", "name=Ada"]).unwrap();
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"name":"Ada","user_id":7}"#);
    }
}
