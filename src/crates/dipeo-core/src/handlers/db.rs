//! `db` node: file-backed read/write/append through the filesystem port.

use super::{HandlerRequest, NodeHandler};
use crate::diagram::{DbOperation, NodeConfig, NodeType};
use crate::error::{DipeoError, Result};
use crate::services::FILE_SYSTEM;
use async_trait::async_trait;
use dipeo_state::Envelope;
use serde_json::{json, Value};

pub struct DbHandler;

#[async_trait]
impl NodeHandler for DbHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Db
    }

    async fn handle(&self, request: HandlerRequest<'_>) -> Result<Envelope> {
        let NodeConfig::Db { operation, file } = &request.node.config else {
            return Err(DipeoError::node_execution(
                &request.node.id,
                "db node without db config",
            ));
        };
        let fs = request.services.resolve(FILE_SYSTEM)?;

        match operation {
            DbOperation::Read => {
                let contents = fs.read_to_string(file).await.map_err(|e| {
                    DipeoError::node_execution(&request.node.id, format!("read '{file}': {e}"))
                })?;
                // JSON documents come back structured, everything else raw.
                let body = serde_json::from_str::<Value>(&contents)
                    .unwrap_or(Value::String(contents));
                Ok(request.envelope(body))
            }
            DbOperation::Write | DbOperation::Append => {
                let payload = request
                    .default_input()
                    .map(|env| env.body.clone())
                    .unwrap_or(Value::Null);
                let contents = match &payload {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other)?,
                };
                match operation {
                    DbOperation::Write => fs.write(file, &contents).await?,
                    _ => fs.append(file, &contents).await?,
                }
                Ok(request.envelope(json!({"file": file, "written": true})))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{FileSystemPort, FILE_SYSTEM};
    use crate::testing::{run_handler_with, test_registry};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[derive(Default)]
    struct MemFs {
        files: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl FileSystemPort for MemFs {
        async fn read_to_string(&self, path: &str) -> Result<String> {
            self.files
                .lock()
                .get(path)
                .cloned()
                .ok_or_else(|| DipeoError::Execution(format!("not found: {path}")))
        }

        async fn write(&self, path: &str, contents: &str) -> Result<()> {
            self.files.lock().insert(path.into(), contents.into());
            Ok(())
        }

        async fn append(&self, path: &str, contents: &str) -> Result<()> {
            self.files
                .lock()
                .entry(path.into())
                .or_default()
                .push_str(contents);
            Ok(())
        }

        async fn exists(&self, path: &str) -> bool {
            self.files.lock().contains_key(path)
        }
    }

    #[tokio::test]
    async fn test_db_read_parses_json() {
        let fs = Arc::new(MemFs::default());
        fs.write("data.json", r#"{"n": 1}"#).await.unwrap();
        let registry = test_registry();
        registry.register(FILE_SYSTEM, fs as Arc<dyn FileSystemPort>);

        let config = NodeConfig::Db {
            operation: DbOperation::Read,
            file: "data.json".into(),
        };
        let output = run_handler_with(DbHandler, config, [], [], registry)
            .await
            .unwrap();
        assert_eq!(output.body, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_db_write_and_append() {
        let fs = Arc::new(MemFs::default());
        let registry = test_registry();
        registry.register(FILE_SYSTEM, fs.clone() as Arc<dyn FileSystemPort>);

        let write = NodeConfig::Db {
            operation: DbOperation::Write,
            file: "out.txt".into(),
        };
        run_handler_with(DbHandler, write, [], [("default", json!("hello"))], registry.clone())
            .await
            .unwrap();

        let append = NodeConfig::Db {
            operation: DbOperation::Append,
            file: "out.txt".into(),
        };
        run_handler_with(DbHandler, append, [], [("default", json!(" world"))], registry)
            .await
            .unwrap();

        assert_eq!(fs.read_to_string("out.txt").await.unwrap(), "hello world");
    }
}
