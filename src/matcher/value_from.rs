use std::{collections::BTreeMap, time::Duration};

use csv::StringRecord;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::{Result, configuration_error, filter_error, policy_validation},
    keypath::KeyPath,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ValuesFormat {
    Json,
    Csv,
    Csv2dict,
    Txt,
}

/// External source for the right-hand side of a value match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ValuesFrom {
    pub url: String,
    #[serde(default)]
    pub format: Option<ValuesFormat>,
    /// Key path (json/csv2dict) or column index (csv) selecting the values.
    #[serde(default)]
    pub expr: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ValuesFrom {
    pub fn validate(&self) -> Result<()> {
        self.resolved_format()?;
        match &self.expr {
            None => {}
            Some(Value::String(expr)) => {
                KeyPath::parse(expr).map_err(|err| {
                    policy_validation(format!("invalid value_from expr '{expr}': {err}"))
                })?;
            }
            Some(expr) if expr.is_u64() => {}
            Some(other) => {
                return Err(policy_validation(format!(
                    "value_from expr must be a key path or column index, got {other}"
                )));
            }
        }
        Ok(())
    }

    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.url.clone())
    }

    /// Explicit format, else inferred from the URL extension.
    pub fn resolved_format(&self) -> Result<ValuesFormat> {
        if let Some(format) = self.format {
            return Ok(format);
        }
        let path = self.url.split(['?', '#']).next().unwrap_or_default();
        let extension = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
        match extension.as_str() {
            "json" => Ok(ValuesFormat::Json),
            "csv" => Ok(ValuesFormat::Csv),
            "txt" => Ok(ValuesFormat::Txt),
            _ => Err(policy_validation(format!(
                "value_from url '{}' needs an explicit format",
                self.url
            ))),
        }
    }

    /// Fetches and parses the source into a JSON array.
    pub async fn fetch(&self, timeout: Duration) -> Result<Value> {
        let body = self.read_body(timeout).await?;
        self.parse(&body)
    }

    async fn read_body(&self, timeout: Duration) -> Result<String> {
        let url = self.url.as_str();
        if url.starts_with("http://") || url.starts_with("https://") {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| configuration_error(format!("http client error: {err}")))?;
            let mut request = client.get(url);
            for (name, value) in &self.headers {
                request = request.header(name, value);
            }
            let response = request
                .send()
                .await
                .map_err(|err| filter_error(format!("value_from fetch '{url}' failed: {err}")))?
                .error_for_status()
                .map_err(|err| filter_error(format!("value_from fetch '{url}' failed: {err}")))?;
            return response
                .text()
                .await
                .map_err(|err| filter_error(format!("value_from read '{url}' failed: {err}")));
        }

        let path = url.strip_prefix("file://").unwrap_or(url);
        if path.contains("://") {
            return Err(filter_error(format!(
                "value_from url scheme is not supported: '{url}'"
            )));
        }
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| filter_error(format!("value_from read '{path}' failed: {err}")))
    }

    pub fn parse(&self, body: &str) -> Result<Value> {
        let values = match self.resolved_format()? {
            ValuesFormat::Json => {
                let data: Value = serde_json::from_str(body).map_err(|err| {
                    filter_error(format!("value_from '{}' is not json: {err}", self.url))
                })?;
                match self.expr_path()? {
                    Some(path) => path.search(&data),
                    None => data,
                }
            }
            ValuesFormat::Txt => Value::Array(
                body.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(Value::from)
                    .collect(),
            ),
            ValuesFormat::Csv => {
                let rows = self.read_csv(body)?;
                match self.expr.as_ref().and_then(Value::as_u64) {
                    Some(column) => Value::Array(
                        rows.iter()
                            .filter_map(|row| row.get(column as usize))
                            .map(Value::from)
                            .collect(),
                    ),
                    None => Value::Array(rows.iter().flatten().map(Value::from).collect()),
                }
            }
            ValuesFormat::Csv2dict => {
                let mut rows = self.read_csv(body)?.into_iter();
                let header = rows.next().unwrap_or_default();
                let records: Vec<Value> = rows
                    .map(|row| {
                        let record: Map<String, Value> = header
                            .iter()
                            .map(str::to_string)
                            .zip(row.iter().map(Value::from))
                            .collect();
                        Value::Object(record)
                    })
                    .collect();
                match &self.expr {
                    Some(Value::String(expr)) if header.iter().any(|name| name == expr.as_str()) => {
                        Value::Array(
                            records
                                .iter()
                                .filter_map(|record| record.get(expr).cloned())
                                .collect(),
                        )
                    }
                    Some(Value::String(_)) => match self.expr_path()? {
                        Some(path) => path.search(&Value::Array(records)),
                        None => Value::Array(records),
                    },
                    _ => Value::Array(records),
                }
            }
        };
        Ok(as_value_list(values))
    }

    /// Reads every row, header included; rows may differ in length.
    fn read_csv(&self, body: &str) -> Result<Vec<StringRecord>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(body.as_bytes())
            .records()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| filter_error(format!("value_from '{}' is not csv: {err}", self.url)))
    }

    fn expr_path(&self) -> Result<Option<KeyPath>> {
        match &self.expr {
            Some(Value::String(expr)) => KeyPath::parse(expr).map(Some).map_err(|err| {
                policy_validation(format!("invalid value_from expr '{expr}': {err}"))
            }),
            _ => Ok(None),
        }
    }
}

fn as_value_list(values: Value) -> Value {
    match values {
        Value::Array(_) => values,
        Value::Null => Value::Array(Vec::new()),
        Value::Object(map) => Value::Array(map.into_iter().map(|(key, _)| Value::from(key)).collect()),
        scalar => Value::Array(vec![scalar]),
    }
}
