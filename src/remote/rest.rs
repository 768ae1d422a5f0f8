//! PostgREST client.

use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde_json::Value;
use url::Url;

use super::{BoxFuture, Filters, MutationOp, RemoteError, RemoteStore};
use crate::cache::{CollectionName, Record, RecordId};

/// Remote store speaking the PostgREST dialect (`/rest/v1/{table}`).
#[derive(Clone)]
pub struct RestStore {
  client: Client,
  base: Url,
  api_key: String,
}

impl RestStore {
  /// `base` is the project URL, e.g. `https://xyz.supabase.co`.
  pub fn new(base: &str, api_key: impl Into<String>) -> Result<Self, RemoteError> {
    let mut base = Url::parse(base).map_err(|e| RemoteError::Network(format!("invalid url {base}: {e}")))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }
    let base = base
      .join("rest/v1/")
      .map_err(|e| RemoteError::Network(e.to_string()))?;

    let client = Client::builder()
      .gzip(true)
      .build()
      .map_err(|e| RemoteError::Network(format!("failed to create http client: {e}")))?;

    Ok(Self {
      client,
      base,
      api_key: api_key.into(),
    })
  }

  fn table_url(&self, name: CollectionName) -> Result<Url, RemoteError> {
    self
      .base
      .join(name.as_str())
      .map_err(|e| RemoteError::Network(e.to_string()))
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
      .header(header::ACCEPT, "application/json")
  }

  fn fetch_url(&self, name: CollectionName, filters: &Filters) -> Result<Url, RemoteError> {
    let mut url = self.table_url(name)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("select", "*");
      for (field, value) in filters.iter() {
        query.append_pair(field, &format!("eq.{value}"));
      }
    }
    Ok(url)
  }

  fn row_url(&self, name: CollectionName, id: &RecordId) -> Result<Url, RemoteError> {
    let mut url = self.table_url(name)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{id}"));
    Ok(url)
  }

  fn write_request(&self, name: CollectionName, op: &MutationOp) -> Result<RequestBuilder, RemoteError> {
    let builder = match op {
      MutationOp::Create { payload } => self
        .request(Method::POST, self.table_url(name)?)
        .json(payload),
      MutationOp::Update { id, patch } => self
        .request(Method::PATCH, self.row_url(name, id)?)
        .json(patch),
      MutationOp::Delete { id } => self.request(Method::DELETE, self.row_url(name, id)?),
    };
    Ok(builder.header("Prefer", "return=representation"))
  }
}

impl RemoteStore for RestStore {
  fn fetch_collection(&self, name: CollectionName, filters: &Filters) -> BoxFuture<Vec<Record>> {
    let request = self
      .fetch_url(name, filters)
      .map(|url| self.request(Method::GET, url));

    Box::pin(async move {
      let response = send(request?).await?;
      let rows: Vec<Value> = decode(response).await?;
      tracing::trace!(collection = %name, rows = rows.len(), "fetched rows");
      Ok(rows.into_iter().filter_map(Record::from_value).collect())
    })
  }

  fn submit_mutation(&self, name: CollectionName, op: MutationOp) -> BoxFuture<Record> {
    let request = self.write_request(name, &op);

    Box::pin(async move {
      let response = send(request?).await?;
      let rows: Vec<Value> = decode(response).await?;
      // PostgREST returns the affected rows as an array
      rows
        .into_iter()
        .next()
        .and_then(Record::from_value)
        .ok_or_else(|| match op.target() {
          Some(id) => RemoteError::NotFound {
            collection: name,
            id: id.clone(),
          },
          None => RemoteError::Decode(format!("{name}: empty response to create")),
        })
    })
  }
}

async fn send(request: RequestBuilder) -> Result<Response, RemoteError> {
  let response = request
    .send()
    .await
    .map_err(|e| RemoteError::Network(e.to_string()))?;

  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }

  // PostgREST errors carry a JSON body with a `message` field
  let body = response.text().await.unwrap_or_default();
  let message = serde_json::from_str::<Value>(&body)
    .ok()
    .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
    .unwrap_or(body);
  Err(RemoteError::Rejected {
    status: status.as_u16(),
    message,
  })
}

async fn decode(response: Response) -> Result<Vec<Value>, RemoteError> {
  response
    .json()
    .await
    .map_err(|e| RemoteError::Decode(e.to_string()))
}
