use async_trait::async_trait;
use reqwest::Url;
use reqwest::multipart::Form;
use serde::Deserialize;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use std::fmt;

use crate::error::ClientError;
use crate::types::{ClassificationResponse, EncodedPayload, Prediction};

/// Path of the classification route, relative to the server root.
pub const CLASSIFY_PATH: &str = "/classify_image";

/// Multipart field carrying the base64 image.
pub const IMAGE_FIELD: &str = "image_data";

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        payload: EncodedPayload,
    ) -> Result<ClassificationResponse, ClientError>;
}

/// Sends one multipart POST per call. No retries, no timeout.
pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint: Url,
}

impl HttpClassifier {
    pub fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[tracing::instrument(
        skip(self, payload),
        fields(endpoint = %self.endpoint, payload_len = payload.as_str().len())
    )]
    async fn classify(
        &self,
        payload: EncodedPayload,
    ) -> Result<ClassificationResponse, ClientError> {
        let form = Form::new().text(IMAGE_FIELD, payload.into_string());

        let response = self
            .http
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                "Classification server returned an error status"
            );
            return Err(ClientError::Server(status.as_u16()));
        }

        let body = response.bytes().await?;
        let predictions = parse_response(&body)?;
        tracing::debug!(predictions = predictions.len(), "Classification response parsed");
        Ok(predictions)
    }
}

#[derive(Debug, Deserialize)]
struct WirePrediction {
    class: String,
    class_probability: Vec<Vec<f64>>,
    #[serde(deserialize_with = "ordered_dictionary")]
    class_dictionary: Vec<(String, usize)>,
}

impl TryFrom<WirePrediction> for Prediction {
    type Error = ClientError;

    fn try_from(wire: WirePrediction) -> Result<Self, Self::Error> {
        let probabilities = wire
            .class_probability
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Malformed("class_probability is empty".into()))?;

        Ok(Prediction {
            class_name: wire.class,
            probabilities,
            class_dictionary: wire.class_dictionary,
        })
    }
}

/// Parses the JSON array returned by the server. An empty array is valid.
pub fn parse_response(body: &[u8]) -> Result<ClassificationResponse, ClientError> {
    let wire: Vec<WirePrediction> =
        serde_json::from_slice(body).map_err(|e| ClientError::Malformed(e.to_string()))?;
    wire.into_iter().map(Prediction::try_from).collect()
}

/// Keeps `class_dictionary` entries in document order and rejects repeated
/// labels.
fn ordered_dictionary<'de, D>(deserializer: D) -> Result<Vec<(String, usize)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct DictionaryVisitor;

    impl<'de> Visitor<'de> for DictionaryVisitor {
        type Value = Vec<(String, usize)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an object mapping labels to probability indices")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries: Vec<(String, usize)> =
                Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((label, index)) = map.next_entry::<String, usize>()? {
                if entries.iter().any(|(existing, _)| *existing == label) {
                    return Err(de::Error::custom(format!("duplicate label {label:?}")));
                }
                entries.push((label, index));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(DictionaryVisitor)
}
