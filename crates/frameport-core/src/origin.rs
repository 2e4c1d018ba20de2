use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Reserved query parameter carrying the host origin on a plugin's load URL.
pub const HOST_ORIGIN_PARAM: &str = "hostOrigin";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("url `{0}` has an opaque origin")]
    Opaque(String),
}

/// Sender identity of one side of a message channel.
///
/// Always the ASCII serialization of a tuple origin (`scheme://host[:port]`,
/// default ports elided), so two identities are compared by plain string
/// equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin(String);

impl Origin {
    pub fn from_url(input: &str) -> Result<Self, OriginError> {
        let url = parse_url(input)?;
        Self::from_parsed(&url)
    }

    pub fn from_parsed(url: &Url) -> Result<Self, OriginError> {
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(OriginError::Opaque(url.as_str().to_string()));
        }
        Ok(Self(origin.ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse_url(input: &str) -> Result<Url, OriginError> {
    Url::parse(input.trim()).map_err(|err| OriginError::InvalidUrl {
        url: input.to_string(),
        reason: err.to_string(),
    })
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub fn with_query_param(url: &Url, name: &str, value: &str) -> Url {
    let mut out = url.clone();
    out.query_pairs_mut().append_pair(name, value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_drops_path_query_and_default_port() {
        let origin = Origin::from_url("https://ext.example:443/p1/index.html?x=1#frag")
            .expect("derive origin");
        assert_eq!(origin.as_str(), "https://ext.example");
    }

    #[test]
    fn origin_keeps_non_default_port() {
        let origin = Origin::from_url("http://localhost:8080/plugin").expect("derive origin");
        assert_eq!(origin.as_str(), "http://localhost:8080");
    }

    #[test]
    fn opaque_and_invalid_urls_are_rejected() {
        assert!(matches!(
            Origin::from_url("data:text/html,hello"),
            Err(OriginError::Opaque(_))
        ));
        assert!(matches!(
            Origin::from_url("not a url"),
            Err(OriginError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn query_param_reads_encoded_host_origin() {
        let base = parse_url("https://ext.example/p1?theme=dark").expect("parse");
        let url = with_query_param(&base, HOST_ORIGIN_PARAM, "https://host.example");

        assert_eq!(
            query_param(&url, HOST_ORIGIN_PARAM).as_deref(),
            Some("https://host.example")
        );
        assert_eq!(query_param(&url, "theme").as_deref(), Some("dark"));
        assert_eq!(query_param(&url, "missing"), None);
    }
}
