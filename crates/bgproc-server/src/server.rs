//! MCP stdio server: newline-delimited JSON-RPC over a byte stream.
//!
//! Requests are read sequentially, but each `tools/call` runs on its own
//! task so slow operations on one session never hold up another. All
//! responses funnel through a single writer task, one line each.

use crate::mcp::ToolRouter;
use bgproc_core::messages::{
    RpcError, RpcRequest, RpcResponse, ToolCallParams, JSONRPC_VERSION,
};
use bgproc_core::{json_decode, line_encode, LineDecoder, ProcResult, PROTOCOL_VERSION};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Name reported in `initialize`.
pub const SERVER_NAME: &str = "bgproc";

/// Capacity of the outbound response queue.
const RESPONSE_QUEUE: usize = 64;

pub struct McpServer {
    router: ToolRouter,
}

impl McpServer {
    pub fn new(router: ToolRouter) -> Self {
        Self { router }
    }

    /// Serve requests from `reader` until EOF, writing responses to `writer`.
    ///
    /// In-flight tool calls are allowed to finish before this returns.
    pub async fn serve<R, W>(&self, mut reader: R, writer: W) -> ProcResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<RpcResponse>(RESPONSE_QUEUE);
        let writer_task = tokio::spawn(write_responses(writer, rx));

        let mut decoder = LineDecoder::new();
        let mut calls = JoinSet::new();
        let mut buf = vec![0u8; 8192];

        info!(tools = self.router.count(), "MCP server ready");

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for line in decoder.feed(&buf[..n]) {
                self.dispatch(&line, &tx, &mut calls).await;
            }
            while calls.try_join_next().is_some() {}
        }
        if let Some(line) = decoder.finish() {
            self.dispatch(&line, &tx, &mut calls).await;
        }

        debug!(pending = calls.len(), "input closed, draining tool calls");
        while calls.join_next().await.is_some() {}
        drop(tx);

        if let Err(e) = writer_task.await {
            warn!(error = %e, "response writer task failed");
        }
        info!("MCP server input closed");
        Ok(())
    }

    async fn dispatch(
        &self,
        line: &[u8],
        tx: &mpsc::Sender<RpcResponse>,
        calls: &mut JoinSet<()>,
    ) {
        let request: RpcRequest = match json_decode(line) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "unparseable request");
                let _ = tx
                    .send(RpcResponse::failure(Value::Null, RpcError::parse_error(e.to_string())))
                    .await;
                return;
            }
        };

        if request.jsonrpc != JSONRPC_VERSION {
            let id = request.id.unwrap_or(Value::Null);
            let _ = tx
                .send(RpcResponse::failure(
                    id,
                    RpcError::invalid_request(format!(
                        "unsupported jsonrpc version: {}",
                        request.jsonrpc
                    )),
                ))
                .await;
            return;
        }

        if request.is_notification() {
            debug!(method = %request.method, "notification received");
            return;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        debug!(method = %request.method, id = %id, "request received");
        match request.method.as_str() {
            "initialize" => {
                let result = json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                });
                let _ = tx.send(RpcResponse::success(id, result)).await;
            }
            "ping" => {
                let _ = tx.send(RpcResponse::success(id, json!({}))).await;
            }
            "tools/list" => {
                let result = json!({ "tools": self.router.list_tools() });
                let _ = tx.send(RpcResponse::success(id, result)).await;
            }
            "tools/call" => {
                let params: ToolCallParams =
                    match serde_json::from_value(request.params.unwrap_or(Value::Null)) {
                        Ok(params) => params,
                        Err(e) => {
                            let _ = tx
                                .send(RpcResponse::failure(
                                    id,
                                    RpcError::invalid_params(format!("invalid tools/call params: {e}")),
                                ))
                                .await;
                            return;
                        }
                    };
                let router = self.router.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    let response = match router.call(params).await {
                        Ok(result) => match serde_json::to_value(&result) {
                            Ok(value) => RpcResponse::success(id, value),
                            Err(e) => RpcResponse::failure(id, RpcError::internal(e.to_string())),
                        },
                        Err(rpc_error) => RpcResponse::failure(id, rpc_error),
                    };
                    let _ = tx.send(response).await;
                });
            }
            other => {
                let _ = tx
                    .send(RpcResponse::failure(id, RpcError::method_not_found(other)))
                    .await;
            }
        }
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::Receiver<RpcResponse>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let line = match line_encode(&response) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to encode response");
                continue;
            }
        };
        if let Err(e) = writer.write_all(&line).await {
            error!(error = %e, "failed to write response, closing output");
            break;
        }
        if let Err(e) = writer.flush().await {
            error!(error = %e, "failed to flush response, closing output");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ServiceSettings, SessionService};
    use crate::session::mock::MockDriver;
    use std::sync::Arc;

    fn server() -> McpServer {
        let driver = Arc::new(MockDriver::new());
        let service = Arc::new(SessionService::new(driver, ServiceSettings::default()));
        McpServer::new(ToolRouter::new(service))
    }

    /// Feed `input` to a fresh server and collect every response line.
    async fn exchange(server: McpServer, input: &str) -> Vec<Value> {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_side);
        let serving = tokio::spawn(async move { server.serve(server_read, server_write).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.unwrap();
        serving.await.unwrap().unwrap();

        output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn by_id(responses: &[Value], id: i64) -> &Value {
        responses
            .iter()
            .find(|r| r["id"] == id)
            .unwrap_or_else(|| panic!("no response with id {id}: {responses:?}"))
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#,
            "\n",
        );
        let responses = exchange(server(), input).await;
        // The notification gets no reply.
        assert_eq!(responses.len(), 2);

        let init = by_id(&responses, 1);
        assert_eq!(init["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["result"]["serverInfo"]["name"], SERVER_NAME);

        let tools = by_id(&responses, 2)["result"]["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t["name"] == "process_send_keys"));
        assert!(tools.iter().all(|t| t.get("inputSchema").is_some()));
    }

    #[tokio::test]
    async fn tool_calls_return_results_and_error_flags() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"process_list","arguments":{}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"process_status","arguments":{"sessionId":"ghost"}}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"process_log","arguments":{"sessionId":"ghost"}}}"#,
            "\n",
        );
        let responses = exchange(server(), input).await;
        assert_eq!(responses.len(), 3);

        let list = &by_id(&responses, 1)["result"];
        assert_eq!(list["isError"], false);
        let payload: Value =
            serde_json::from_str(list["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(payload["count"], 0);

        let status = &by_id(&responses, 2)["result"];
        assert_eq!(status["isError"], true);
        assert_eq!(status["content"][0]["text"], "Session 'ghost' not found");

        let log = &by_id(&responses, 3)["result"];
        assert_eq!(log["isError"], false);
        let page: Value =
            serde_json::from_str(log["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(page["total"], 0);
        assert_eq!(page["entries"], json!([]));
    }

    #[tokio::test]
    async fn protocol_errors() {
        let input = concat!(
            "{not json\n",
            r#"{"jsonrpc":"2.0","id":7,"method":"resources/list"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":8,"method":"tools/call","params":{"name":"nope","arguments":{}}}"#,
            "\n",
            r#"{"jsonrpc":"1.0","id":9,"method":"ping"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","id":10,"method":"ping"}"#,
        );
        let responses = exchange(server(), input).await;
        assert_eq!(responses.len(), 5);

        let parse = responses.iter().find(|r| r["id"].is_null()).unwrap();
        assert_eq!(parse["error"]["code"], RpcError::PARSE_ERROR);
        assert_eq!(by_id(&responses, 7)["error"]["code"], RpcError::METHOD_NOT_FOUND);
        assert_eq!(by_id(&responses, 8)["error"]["code"], RpcError::INVALID_PARAMS);
        assert_eq!(by_id(&responses, 9)["error"]["code"], RpcError::INVALID_REQUEST);
        // Last line had no trailing newline and is still answered.
        assert_eq!(by_id(&responses, 10)["result"], json!({}));
    }

    #[tokio::test]
    async fn start_then_status_over_the_wire() {
        let driver = Arc::new(MockDriver::new());
        let service = Arc::new(SessionService::new(driver, ServiceSettings::default()));
        let server = McpServer::new(ToolRouter::new(service.clone()));

        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"process_start","arguments":{"command":"bash"}}}"#,
            "\n",
        );
        let responses = exchange(server, input).await;
        let started = &by_id(&responses, 1)["result"];
        assert_eq!(started["isError"], false);
        let record: Value =
            serde_json::from_str(started["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(record["status"], "running");

        let id = record["sessionId"].as_str().unwrap();
        assert!(service.status(id).await.is_ok());
    }
}
