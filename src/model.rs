// Model client
// One stop shop for metadata, tasks, view reads, cell writes and uploads

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::auth::{Token, TokenManager};
use crate::dispatch::ActionDispatcher;
use crate::error::{ClientError, Result};
use crate::http_client::{read_json, AnaplanHttpClient, HttpSettings};
use crate::tasks::{wait_for_completion, TaskDetail, TaskPoller, TaskState, WaitOptions};
use crate::upload::{ChunkUploader, UploadReport};

/// Cells accepted by one write call
pub const MAX_CELLS_PER_WRITE: usize = 1000;

/// Model metadata collections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Imports,
    Exports,
    Actions,
    Processes,
    Files,
    LineItems,
    Views,
}

impl MetadataKind {
    pub fn path(self) -> &'static str {
        match self {
            MetadataKind::Imports => "imports",
            MetadataKind::Exports => "exports",
            MetadataKind::Actions => "actions",
            MetadataKind::Processes => "processes",
            MetadataKind::Files => "files",
            MetadataKind::LineItems => "lineItems",
            MetadataKind::Views => "views",
        }
    }

    /// Payload field holding the collection
    pub fn field(self) -> &'static str {
        match self {
            MetadataKind::LineItems => "items",
            other => other.path(),
        }
    }
}

impl std::str::FromStr for MetadataKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "imports" => Ok(MetadataKind::Imports),
            "exports" => Ok(MetadataKind::Exports),
            "actions" => Ok(MetadataKind::Actions),
            "processes" => Ok(MetadataKind::Processes),
            "files" => Ok(MetadataKind::Files),
            "lineitems" => Ok(MetadataKind::LineItems),
            "views" => Ok(MetadataKind::Views),
            other => Err(format!("unknown metadata collection '{}'", other)),
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Dimension item coordinate of a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionItem {
    pub dimension_name: String,
    pub item_name: String,
}

impl DimensionItem {
    pub fn new(dimension_name: impl Into<String>, item_name: impl Into<String>) -> Self {
        Self {
            dimension_name: dimension_name.into(),
            item_name: item_name.into(),
        }
    }
}

/// One cell to write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellWrite {
    pub line_item_id: String,
    pub dimensions: Vec<DimensionItem>,
    pub value: Value,
}

impl CellWrite {
    pub fn new(
        line_item_id: impl Into<String>,
        dimensions: Vec<DimensionItem>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            line_item_id: line_item_id.into(),
            dimensions,
            value: value.into(),
        }
    }
}

/// Connection to one workspace/model
pub struct AnaplanModel {
    http: Arc<AnaplanHttpClient>,
    dispatcher: ActionDispatcher,
    poller: TaskPoller,
    uploader: ChunkUploader,
}

impl AnaplanModel {
    pub fn new(
        token_manager: Arc<TokenManager>,
        settings: &HttpSettings,
        chunk_size: u64,
    ) -> Result<Self> {
        let http = Arc::new(AnaplanHttpClient::new(token_manager, settings)?);
        Self::from_http(http, chunk_size)
    }

    pub fn from_http(http: Arc<AnaplanHttpClient>, chunk_size: u64) -> Result<Self> {
        let dispatcher = ActionDispatcher::new(http.clone());
        let poller = TaskPoller::new(dispatcher.clone());
        let uploader = ChunkUploader::new(http.clone(), chunk_size)?;

        Ok(Self {
            http,
            dispatcher,
            poller,
            uploader,
        })
    }

    /// Obtain (or reuse) a token now, failing fast on bad credentials
    pub async fn authenticate(&self) -> Result<Token> {
        self.http.token_manager().current_token().await
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    pub fn poller(&self) -> &TaskPoller {
        &self.poller
    }

    /// List one metadata collection
    pub async fn list(&self, kind: MetadataKind) -> Result<Vec<Value>> {
        let body = self.http.get_json(kind.path()).await?;
        Ok(body
            .get(kind.field())
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn imports(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::Imports).await
    }

    pub async fn exports(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::Exports).await
    }

    pub async fn actions(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::Actions).await
    }

    pub async fn processes(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::Processes).await
    }

    pub async fn files(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::Files).await
    }

    pub async fn line_items(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::LineItems).await
    }

    pub async fn views(&self) -> Result<Vec<Value>> {
        self.list(MetadataKind::Views).await
    }

    /// Start an import/export/action/process
    pub async fn run(&self, action_id: &str) -> Result<Value> {
        self.dispatcher.start(action_id).await
    }

    /// Detail of the latest task of an action
    pub async fn monitor(&self, action_id: &str) -> Result<TaskDetail> {
        self.poller.poll(action_id).await
    }

    pub async fn status(&self, action_id: &str) -> Result<TaskState> {
        self.poller.status(action_id).await
    }

    /// Start an action and poll it to a terminal state
    pub async fn run_and_wait(&self, action_id: &str, options: WaitOptions) -> Result<TaskDetail> {
        self.run(action_id).await?;
        wait_for_completion(&self.poller, action_id, options).await
    }

    /// Live data of a module view or saved view
    pub async fn read_view(&self, view_id: &str) -> Result<Value> {
        self.http
            .get_json(&format!("views/{}/data?format=v1", view_id))
            .await
    }

    /// Write up to `MAX_CELLS_PER_WRITE` cells into a module
    pub async fn write_cells(&self, module_id: &str, cells: &[CellWrite]) -> Result<Value> {
        if cells.is_empty() {
            return Err(ClientError::Validation("no cells to write".to_string()));
        }
        if cells.len() > MAX_CELLS_PER_WRITE {
            return Err(ClientError::Validation(format!(
                "{} cells exceed the limit of {} per call",
                cells.len(),
                MAX_CELLS_PER_WRITE
            )));
        }

        tracing::debug!(module_id = module_id, cells = cells.len(), "Writing cells");

        let builder = self
            .http
            .request(Method::POST, &format!("modules/{}/data", module_id))
            .await?
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(cells);

        let response = self.http.request_no_retry(builder).await?;
        read_json(response).await
    }

    /// Upload a local file into a model file slot
    pub async fn upload(&self, file_id: &str, path: &Path) -> Result<UploadReport> {
        self.uploader.upload(file_id, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::tests::test_client;
    use mockito::Matcher;
    use serde_json::json;

    fn model(url: &str) -> AnaplanModel {
        AnaplanModel::from_http(Arc::new(test_client(url)), 1024).unwrap()
    }

    #[test]
    fn test_metadata_kind_parse() {
        assert_eq!("imports".parse::<MetadataKind>(), Ok(MetadataKind::Imports));
        assert_eq!("line-items".parse::<MetadataKind>(), Ok(MetadataKind::LineItems));
        assert_eq!("lineItems".parse::<MetadataKind>(), Ok(MetadataKind::LineItems));
        assert!("modules".parse::<MetadataKind>().is_err());
    }

    #[test]
    fn test_cell_write_serialization() {
        let cell = CellWrite::new(
            "221000000001",
            vec![DimensionItem::new("File List", "File 1")],
            true,
        );
        assert_eq!(
            serde_json::to_value(&cell).unwrap(),
            json!({
                "lineItemId": "221000000001",
                "dimensions": [{"dimensionName": "File List", "itemName": "File 1"}],
                "value": true
            })
        );
    }

    #[tokio::test]
    async fn test_line_items_read_from_items_field() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/workspaces/ws1/models/m1/lineItems")
            .with_status(200)
            .with_body(r#"{"items":[{"id":"221000000001","name":"Flag"}]}"#)
            .create_async()
            .await;

        let items = model(&server.url()).line_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["name"], "Flag");
    }

    #[tokio::test]
    async fn test_list_processes() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/workspaces/ws1/models/m1/processes")
            .with_status(200)
            .with_body(r#"{"processes":[{"id":"118000000000"},{"id":"118000000001"}]}"#)
            .create_async()
            .await;

        let processes = model(&server.url()).processes().await.unwrap();
        assert_eq!(processes.len(), 2);
    }

    #[tokio::test]
    async fn test_read_view_uses_v1_format() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/workspaces/ws1/models/m1/views/102000000001/data")
            .match_query(Matcher::UrlEncoded("format".into(), "v1".into()))
            .with_status(200)
            .with_body(r#"{"rows":[{"cells":["true","Jan 24"]}]}"#)
            .create_async()
            .await;

        let view = model(&server.url()).read_view("102000000001").await.unwrap();
        assert_eq!(view["rows"][0]["cells"][0], "true");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_cells_posts_batch() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/workspaces/ws1/models/m1/modules/101000000001/data")
            .match_body(Matcher::Json(json!([
                {
                    "lineItemId": "221000000001",
                    "dimensions": [{"dimensionName": "File List", "itemName": "File 1"}],
                    "value": false
                }
            ])))
            .with_status(200)
            .with_body(r#"{"numberOfCellsChanged":1}"#)
            .create_async()
            .await;

        let cells = vec![CellWrite::new(
            "221000000001",
            vec![DimensionItem::new("File List", "File 1")],
            false,
        )];
        let result = model(&server.url())
            .write_cells("101000000001", &cells)
            .await
            .unwrap();

        assert_eq!(result["numberOfCellsChanged"], 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_write_cells_limit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let cells: Vec<CellWrite> = (0..=MAX_CELLS_PER_WRITE)
            .map(|i| CellWrite::new("221", vec![], i as u64))
            .collect();
        let err = model(&server.url())
            .write_cells("101000000001", &cells)
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Validation(_)));

        let err = model(&server.url())
            .write_cells("101000000001", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        mock.assert_async().await;
    }
}
