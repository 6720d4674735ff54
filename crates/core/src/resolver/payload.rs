//! Schema of the page's embedded state and identifier extraction.

use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("Invalid embedded payload: {0}")]
    InvalidJson(String),

    #[error("Embedded payload has no instrument identifier")]
    MissingIdentifier,
}

#[derive(Debug, Deserialize)]
struct EmbeddedDocument {
    props: Props,
}

#[derive(Debug, Deserialize)]
struct Props {
    #[serde(rename = "pageProps")]
    page_props: PageProps,
}

#[derive(Debug, Deserialize)]
struct PageProps {
    /// JSON document serialized into a string.
    state: String,
}

#[derive(Debug, Deserialize)]
struct PageState {
    #[serde(rename = "dataStore")]
    data_store: DataStore,
}

#[derive(Debug, Deserialize)]
struct DataStore {
    #[serde(rename = "pageInfoStore")]
    page_info_store: PageInfoStore,
}

#[derive(Debug, Deserialize)]
struct PageInfoStore {
    identifiers: Identifiers,
}

#[derive(Debug, Deserialize)]
struct Identifiers {
    #[serde(default, deserialize_with = "loose_id_opt")]
    instrument_id: Option<String>,
}

/// An identifier the source sends either as a number or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LooseId {
    Number(i64),
    Text(String),
}

impl LooseId {
    fn into_string(self) -> String {
        match self {
            LooseId::Number(n) => n.to_string(),
            LooseId::Text(s) => s.trim().to_string(),
        }
    }
}

/// Deserialize a number-or-string identifier into a `String`.
pub(crate) fn loose_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    LooseId::deserialize(deserializer).map(LooseId::into_string)
}

fn loose_id_opt<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<LooseId>::deserialize(deserializer)?.map(LooseId::into_string))
}

/// Extract the instrument identifier from the embedded-data element's text.
pub fn extract_instrument_id(embedded: &str) -> Result<String, PayloadError> {
    let document: EmbeddedDocument = serde_json::from_str(embedded)
        .map_err(|e| PayloadError::InvalidJson(format!("document: {}", e)))?;

    let state: PageState = serde_json::from_str(&document.props.page_props.state)
        .map_err(|e| PayloadError::InvalidJson(format!("state: {}", e)))?;

    state
        .data_store
        .page_info_store
        .identifiers
        .instrument_id
        .filter(|id| !id.is_empty())
        .ok_or(PayloadError::MissingIdentifier)
}
