use super::{FieldKind, FieldSchema, QueryResult, TablePath, Warehouse, WriteMode, cell_text};
use crate::config::WarehouseConfig;
use crate::error::WarehouseError;
use async_trait::async_trait;
use gcp_auth::{CustomServiceAccount, TokenProvider};
use log::{debug, info};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const API_ROOT: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_ROOT: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const PAGE_SIZE: u32 = 10_000;
const WAIT_MS: u32 = 10_000;
const BOUNDARY: &str = "crypto_warehouse_load_boundary";

// --- Wire types ---

#[derive(Deserialize, Debug, Default)]
struct SchemaWire {
    #[serde(default)]
    fields: Vec<FieldWire>,
}

#[derive(Deserialize, Debug)]
struct FieldWire {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize, Debug)]
struct RowWire {
    f: Vec<CellWire>,
}

#[derive(Deserialize, Debug)]
struct CellWire {
    #[serde(default)]
    v: Value,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    schema: Option<SchemaWire>,
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<RowWire>,
    page_token: Option<String>,
    #[serde(default)]
    job_complete: bool,
}

#[derive(Deserialize, Debug)]
struct ErrorProto {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    status: JobStatus,
    statistics: Option<Value>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

// --- Client ---

/// BigQuery over its REST API.
pub struct BigQueryClient {
    http: Client,
    auth: Arc<dyn TokenProvider>,
    /// Project that runs (and is billed for) the jobs.
    project_id: String,
    location: Option<String>,
    poll_interval: Duration,
}

impl BigQueryClient {
    /// Authenticates with the configured service account file, or with the
    /// ambient application-default credentials when none is configured.
    pub async fn connect(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        let auth: Arc<dyn TokenProvider> = match &config.credentials_path {
            Some(path) => {
                info!("using service account key {:?}", path);
                Arc::new(CustomServiceAccount::from_file(path)?)
            }
            None => {
                info!("using application default credentials");
                gcp_auth::provider().await?
            }
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            http,
            auth,
            project_id: super::validate_identifier(&config.project_id)?.to_string(),
            location: config.location.clone(),
            poll_interval: Duration::from_secs(1),
        })
    }

    async fn bearer(&self) -> Result<String, WarehouseError> {
        let token = self.auth.token(&[SCOPE]).await?;
        Ok(format!("Bearer {}", token.as_str()))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, WarehouseError> {
        let response = request
            .header("Authorization", self.bearer().await?)
            .send()
            .await?;
        check_status(response).await
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, WarehouseError> {
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }

    fn location_for<'a>(&'a self, job: &'a JobReference) -> Option<&'a str> {
        job.location.as_deref().or(self.location.as_deref())
    }

    async fn query_page(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, WarehouseError> {
        let url = format!("{}/projects/{}/queries/{}", API_ROOT, job.project_id, job.job_id);
        let mut params: Vec<(&str, String)> = vec![
            ("maxResults", PAGE_SIZE.to_string()),
            ("timeoutMs", WAIT_MS.to_string()),
        ];
        if let Some(location) = self.location_for(job) {
            params.push(("location", location.to_string()));
        }
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        self.send_json(self.http.get(&url).query(&params)).await
    }

    /// Waits for a job to reach `DONE` and surfaces its error result.
    async fn wait_for_job(&self, mut job: Job) -> Result<Job, WarehouseError> {
        loop {
            if job.status.state == "DONE" {
                if let Some(err) = &job.status.error_result {
                    return Err(WarehouseError::Job(format!("{} ({})", err.message, err.reason)));
                }
                return Ok(job);
            }
            debug!("job {} is {}", job.job_reference.job_id, job.status.state);
            tokio::time::sleep(self.poll_interval).await;

            let url = format!(
                "{}/projects/{}/jobs/{}",
                API_ROOT, job.job_reference.project_id, job.job_reference.job_id
            );
            let mut request = self.http.get(&url);
            if let Some(location) = self.location_for(&job.job_reference) {
                request = request.query(&[("location", location)]);
            }
            job = self.send_json(request).await?;
        }
    }

    fn job_reference_json(&self) -> Value {
        match &self.location {
            Some(location) => json!({ "location": location }),
            None => json!({}),
        }
    }
}

async fn check_status(response: Response) -> Result<Response, WarehouseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(String::from))
        .unwrap_or(body);
    if status == StatusCode::NOT_FOUND {
        return Err(WarehouseError::NotFound(message));
    }
    Err(WarehouseError::Api {
        status: status.as_u16(),
        message,
    })
}

fn table_reference(table: &TablePath) -> Value {
    json!({
        "projectId": table.project,
        "datasetId": table.dataset,
        "tableId": table.table,
    })
}

fn schema_json(schema: &[FieldSchema]) -> Value {
    let fields: Vec<Value> = schema
        .iter()
        .map(|f| json!({ "name": f.name, "type": f.kind, "mode": "NULLABLE" }))
        .collect();
    json!({ "fields": fields })
}

fn decode_rows(rows: Vec<RowWire>) -> Vec<Vec<Option<String>>> {
    rows.into_iter()
        .map(|row| row.f.into_iter().map(|cell| cell_text(Some(&cell.v))).collect())
        .collect()
}

/// Body of a `multipart/related` upload: job configuration, then the rows as
/// newline-delimited JSON.
fn multipart_body(config: &Value, rows: &[Value]) -> Result<Vec<u8>, WarehouseError> {
    let mut data = String::new();
    for row in rows {
        data.push_str(&serde_json::to_string(row)?);
        data.push('\n');
    }
    let body = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{config}\r\n\
         --{b}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n--{b}--\r\n",
        b = BOUNDARY,
        config = config,
        data = data,
    );
    Ok(body.into_bytes())
}

fn output_rows(job: &Job) -> u64 {
    job.statistics
        .as_ref()
        .and_then(|s| s.pointer("/load/outputRows"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Warehouse for BigQueryClient {
    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        let url = format!("{}/projects/{}/queries", API_ROOT, self.project_id);
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "maxResults": PAGE_SIZE,
            "timeoutMs": WAIT_MS,
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }

        let mut page: QueryResponse = self.send_json(self.http.post(&url).json(&body)).await?;

        while !page.job_complete {
            let job = page
                .job_reference
                .clone()
                .ok_or_else(|| WarehouseError::Decode("incomplete query without job reference".into()))?;
            debug!("waiting for query job {}", job.job_id);
            page = self.query_page(&job, None).await?;
        }

        let schema = page
            .schema
            .take()
            .unwrap_or_default()
            .fields
            .into_iter()
            .map(|f| FieldSchema {
                kind: FieldKind::from_api(&f.kind),
                name: f.name,
            })
            .collect();

        let mut result = QueryResult {
            schema,
            rows: decode_rows(std::mem::take(&mut page.rows)),
        };

        while let Some(token) = page.page_token.take() {
            let job = page
                .job_reference
                .clone()
                .ok_or_else(|| WarehouseError::Decode("paged result without job reference".into()))?;
            debug!("fetching next page of {} ({} rows so far)", job.job_id, result.len());
            let next = self.query_page(&job, Some(&token)).await?;
            result.rows.extend(decode_rows(next.rows));
            page.page_token = next.page_token;
        }

        Ok(result)
    }

    async fn write_rows(
        &self,
        table: &TablePath,
        schema: &[FieldSchema],
        rows: Vec<Value>,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError> {
        let disposition = match mode {
            WriteMode::Replace => "WRITE_TRUNCATE",
            WriteMode::Append => "WRITE_APPEND",
        };
        let config = json!({
            "jobReference": self.job_reference_json(),
            "configuration": {
                "load": {
                    "destinationTable": table_reference(table),
                    "sourceFormat": "NEWLINE_DELIMITED_JSON",
                    "writeDisposition": disposition,
                    "createDisposition": "CREATE_IF_NEEDED",
                    "schema": schema_json(schema),
                }
            }
        });

        let url = format!("{}/projects/{}/jobs", UPLOAD_ROOT, self.project_id);
        let request = self
            .http
            .post(&url)
            .query(&[("uploadType", "multipart")])
            .header(
                "Content-Type",
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(multipart_body(&config, &rows)?);

        let job: Job = self.send_json(request).await?;
        let job = self.wait_for_job(job).await?;
        Ok(output_rows(&job))
    }

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>, WarehouseError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            API_ROOT,
            super::validate_identifier(project)?,
            super::validate_identifier(dataset)?
        );
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut request = self.http.get(&url);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }
            let page: TableList = self.send_json(request).await?;
            tables.extend(page.tables.into_iter().map(|t| t.table_reference.table_id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(tables)
    }

    async fn delete_table(&self, table: &TablePath, not_found_ok: bool) -> Result<(), WarehouseError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            API_ROOT, table.project, table.dataset, table.table
        );
        match self.send(self.http.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(WarehouseError::NotFound(_)) if not_found_ok => {
                debug!("{} did not exist", table);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn copy_table(&self, source: &TablePath, destination: &TablePath) -> Result<(), WarehouseError> {
        let url = format!("{}/projects/{}/jobs", API_ROOT, self.project_id);
        let body = json!({
            "jobReference": self.job_reference_json(),
            "configuration": {
                "copy": {
                    "sourceTable": table_reference(source),
                    "destinationTable": table_reference(destination),
                }
            }
        });
        let job: Job = self.send_json(self.http.post(&url).json(&body)).await?;
        self.wait_for_job(job).await?;
        Ok(())
    }
}

/// A [`BigQueryClient`] that authenticates on the first warehouse call, so
/// tasks served from local storage never need credentials.
pub struct LazyBigQuery {
    config: WarehouseConfig,
    client: OnceCell<BigQueryClient>,
}

impl LazyBigQuery {
    pub fn new(config: WarehouseConfig) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.initialized()
    }

    async fn client(&self) -> Result<&BigQueryClient, WarehouseError> {
        self.client
            .get_or_try_init(|| BigQueryClient::connect(&self.config))
            .await
    }
}

#[async_trait]
impl Warehouse for LazyBigQuery {
    async fn query(&self, sql: &str) -> Result<QueryResult, WarehouseError> {
        self.client().await?.query(sql).await
    }

    async fn write_rows(
        &self,
        table: &TablePath,
        schema: &[FieldSchema],
        rows: Vec<Value>,
        mode: WriteMode,
    ) -> Result<u64, WarehouseError> {
        self.client().await?.write_rows(table, schema, rows, mode).await
    }

    async fn list_tables(&self, project: &str, dataset: &str) -> Result<Vec<String>, WarehouseError> {
        self.client().await?.list_tables(project, dataset).await
    }

    async fn delete_table(&self, table: &TablePath, not_found_ok: bool) -> Result<(), WarehouseError> {
        self.client().await?.delete_table(table, not_found_ok).await
    }

    async fn copy_table(&self, source: &TablePath, destination: &TablePath) -> Result<(), WarehouseError> {
        self.client().await?.copy_table(source, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_response_cells_decode_to_raw_strings() {
        let body = r#"{
            "kind": "bigquery#queryResponse",
            "schema": { "fields": [
                { "name": "asset", "type": "STRING", "mode": "NULLABLE" },
                { "name": "timestamp", "type": "TIMESTAMP", "mode": "NULLABLE" },
                { "name": "close_price", "type": "FLOAT", "mode": "NULLABLE" }
            ]},
            "jobReference": { "projectId": "p", "jobId": "job_1", "location": "US" },
            "totalRows": "2",
            "rows": [
                { "f": [ { "v": "BTC" }, { "v": "1.7040672E9" }, { "v": "42000.5" } ] },
                { "f": [ { "v": "ETH" }, { "v": "1.7040672E9" }, { "v": null } ] }
            ],
            "jobComplete": true
        }"#;
        let page: QueryResponse = serde_json::from_str(body).unwrap();
        assert!(page.job_complete);
        assert_eq!(page.schema.as_ref().unwrap().fields[1].kind, "TIMESTAMP");

        let rows = decode_rows(page.rows);
        assert_eq!(rows[0][0].as_deref(), Some("BTC"));
        assert_eq!(rows[1][2], None);
    }

    #[test]
    fn incomplete_query_has_no_rows() {
        let body = r#"{ "jobReference": { "projectId": "p", "jobId": "j" }, "jobComplete": false }"#;
        let page: QueryResponse = serde_json::from_str(body).unwrap();
        assert!(!page.job_complete);
        assert!(page.rows.is_empty());
        assert!(page.job_reference.unwrap().location.is_none());
    }

    #[test]
    fn multipart_body_carries_config_and_ndjson() {
        let config = json!({ "configuration": { "load": {} } });
        let rows = vec![json!({ "asset": "BTC" }), json!({ "asset": "ETH" })];
        let body = String::from_utf8(multipart_body(&config, &rows).unwrap()).unwrap();

        assert!(body.starts_with(&format!("--{}\r\n", BOUNDARY)));
        assert!(body.contains("{\"asset\":\"BTC\"}\n{\"asset\":\"ETH\"}\n"));
        assert!(body.trim_end().ends_with(&format!("--{}--", BOUNDARY)));
    }

    #[test]
    fn schema_json_uses_api_type_names() {
        let schema = vec![
            FieldSchema::new("timestamp", FieldKind::Timestamp),
            FieldSchema::new("rmse", FieldKind::Float),
        ];
        let rendered = schema_json(&schema);
        assert_eq!(rendered["fields"][0]["type"], "TIMESTAMP");
        assert_eq!(rendered["fields"][1]["type"], "FLOAT");
    }

    #[test]
    fn finished_job_reports_output_rows() {
        let body = r#"{
            "jobReference": { "projectId": "p", "jobId": "load_1" },
            "status": { "state": "DONE" },
            "statistics": { "load": { "outputRows": "128" } }
        }"#;
        let job: Job = serde_json::from_str(body).unwrap();
        assert_eq!(output_rows(&job), 128);
    }

    #[tokio::test]
    async fn lazy_client_authenticates_on_first_call() {
        let config = WarehouseConfig {
            credentials_path: Some("/nonexistent/service-account.json".into()),
            ..Default::default()
        };
        let client = LazyBigQuery::new(config);
        assert!(!client.is_connected());

        let err = client.query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, WarehouseError::Auth(_)), "{:?}", err);
        assert!(!client.is_connected());
    }
}
