// Action routing
// Maps action ids onto their REST collection and starts tasks

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::{ClientError, Result};
use crate::http_client::{read_json, AnaplanHttpClient};

pub const DEFAULT_LOCALE: &str = "en_US";

/// Kind of runnable action, decided by the id's first three digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Import,
    Export,
    Action,
    Process,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::Import,
        ActionKind::Export,
        ActionKind::Action,
        ActionKind::Process,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            ActionKind::Import => "112",
            ActionKind::Export => "116",
            ActionKind::Action => "117",
            ActionKind::Process => "118",
        }
    }

    /// REST collection name
    pub fn collection(self) -> &'static str {
        match self {
            ActionKind::Import => "imports",
            ActionKind::Export => "exports",
            ActionKind::Action => "actions",
            ActionKind::Process => "processes",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.prefix() == prefix)
    }
}

/// Where an action lives in the model API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRoute {
    pub kind: ActionKind,
    pub action_id: String,
}

impl ActionRoute {
    pub fn collection(&self) -> &'static str {
        self.kind.collection()
    }

    /// `{collection}/{id}`
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection(), self.action_id)
    }

    /// `{collection}/{id}/tasks`
    pub fn tasks_path(&self) -> String {
        format!("{}/tasks", self.path())
    }

    /// `{collection}/{id}/tasks/{task}`
    pub fn task_path(&self, task_id: &str) -> String {
        format!("{}/{}", self.tasks_path(), task_id)
    }
}

impl fmt::Display for ActionRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Classify an action id. Pure; unknown prefixes are an input error.
pub fn classify(action_id: &str) -> Result<ActionRoute> {
    let action_id = action_id.trim();

    if action_id.len() < 3 || !action_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ClientError::Classification(action_id.to_string()));
    }

    let kind = ActionKind::from_prefix(&action_id[..3])
        .ok_or_else(|| ClientError::Classification(action_id.to_string()))?;

    Ok(ActionRoute {
        kind,
        action_id: action_id.to_string(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskRequest<'a> {
    locale_name: &'a str,
}

/// Stateless router that starts tasks
#[derive(Clone)]
pub struct ActionDispatcher {
    http: Arc<AnaplanHttpClient>,
}

impl ActionDispatcher {
    pub fn new(http: Arc<AnaplanHttpClient>) -> Self {
        Self { http }
    }

    pub fn http(&self) -> &Arc<AnaplanHttpClient> {
        &self.http
    }

    pub fn classify(&self, action_id: &str) -> Result<ActionRoute> {
        classify(action_id)
    }

    /// Start a task; the server response is returned verbatim
    pub async fn start(&self, action_id: &str) -> Result<Value> {
        let route = classify(action_id)?;
        tracing::info!(action = %route, "Starting task");

        let builder = self
            .http
            .request(Method::POST, &route.tasks_path())
            .await?
            .header("Content-Type", "application/json")
            .json(&TaskRequest {
                locale_name: DEFAULT_LOCALE,
            });

        let response = self.http.request_no_retry(builder).await?;
        read_json(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::tests::test_client;
    use mockito::Matcher;
    use proptest::prelude::*;

    #[test]
    fn test_classify_known_prefixes() {
        assert_eq!(classify("112000000001").unwrap().collection(), "imports");
        assert_eq!(classify("116000000001").unwrap().collection(), "exports");
        assert_eq!(classify("117000000001").unwrap().collection(), "actions");

        let route = classify("118000000000").unwrap();
        assert_eq!(route.kind, ActionKind::Process);
        assert_eq!(route.path(), "processes/118000000000");
        assert_eq!(route.tasks_path(), "processes/118000000000/tasks");
        assert_eq!(
            route.task_path("ABC"),
            "processes/118000000000/tasks/ABC"
        );
    }

    #[test]
    fn test_classify_rejects_unknown() {
        for bad in ["999000000000", "999...", "", "11", "113000000001", "11x000000000"] {
            let err = classify(bad).unwrap_err();
            assert!(matches!(err, ClientError::Classification(_)), "{}", bad);
        }
    }

    proptest! {
        #[test]
        fn prop_classify_is_idempotent(id in "[0-9]{3,15}") {
            let first = classify(&id).ok();
            let second = classify(&id).ok();
            prop_assert_eq!(first, second);
        }

        #[test]
        fn prop_known_prefix_always_routes(kind_idx in 0usize..4, suffix in "[0-9]{9}") {
            let kind = ActionKind::ALL[kind_idx];
            let id = format!("{}{}", kind.prefix(), suffix);
            let route = classify(&id).unwrap();
            prop_assert_eq!(route.kind, kind);
            prop_assert_eq!(route.path(), format!("{}/{}", kind.collection(), id));
        }
    }

    #[tokio::test]
    async fn test_start_posts_locale() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/workspaces/ws1/models/m1/imports/112000000001/tasks")
            .match_body(Matcher::Json(serde_json::json!({"localeName": "en_US"})))
            .with_status(200)
            .with_body(r#"{"task":{"taskId":"T1"},"status":{"code":200}}"#)
            .create_async()
            .await;

        let dispatcher = ActionDispatcher::new(Arc::new(test_client(&server.url())));
        let response = dispatcher.start("112000000001").await.unwrap();

        assert_eq!(response["task"]["taskId"], "T1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_start_unclassifiable_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let dispatcher = ActionDispatcher::new(Arc::new(test_client(&server.url())));
        let err = dispatcher.start("999000000000").await.unwrap_err();

        assert!(matches!(err, ClientError::Classification(_)));
        mock.assert_async().await;
    }
}
