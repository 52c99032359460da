//! JSON-RPC 2.0 envelopes and the mapping between agent wire payloads and
//! [`AgentResponse`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use parley_core::codes;
use parley_core::{
    AgentConfig, AgentError, AgentProtocol, AgentResponse, ConversationId, InputRequest,
    Recovery, ResponseBody, TaskState, TransportError, TurnRequest, WorkId,
};

/// JSON-RPC protocol version sent on every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound JSON-RPC request.
#[derive(Clone, Debug, Serialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Fresh UUIDv7 per request.
    pub id: String,
    /// `message/send`, `tasks/get`, or `tools/call`.
    pub method: &'static str,
    /// Method parameters.
    pub params: Value,
}

impl RpcRequest {
    fn new(method: &'static str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Uuid::now_v7().to_string(),
            method,
            params,
        }
    }
}

/// Inbound JSON-RPC response. Either `result` or `error` is set.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcResponse {
    /// Success payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

/// JSON-RPC error object.
#[derive(Clone, Debug, Deserialize)]
pub struct RpcErrorBody {
    /// JSON-RPC error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Extra error data.
    #[serde(default)]
    pub data: Option<Value>,
}

/// Build the request for one turn.
pub fn build_send(agent: &AgentConfig, request: &TurnRequest) -> RpcRequest {
    match agent.protocol {
        AgentProtocol::A2a => RpcRequest::new("message/send", a2a_send_params(request)),
        AgentProtocol::Mcp => RpcRequest::new("tools/call", mcp_call_params(request)),
    }
}

/// Build the status poll for deferred work. Only A2A agents expose one.
pub fn build_task_get(agent: &AgentConfig, work_id: &WorkId) -> Option<RpcRequest> {
    match agent.protocol {
        AgentProtocol::A2a => Some(RpcRequest::new("tasks/get", json!({ "id": work_id }))),
        AgentProtocol::Mcp => None,
    }
}

fn a2a_send_params(request: &TurnRequest) -> Value {
    let mut parts = vec![json!({
        "kind": "data",
        "data": {
            "skill": request.operation,
            "parameters": request.args,
            "operationId": request.operation_id,
        }
    })];
    if let Some(input) = &request.input {
        parts.push(json!({ "kind": "data", "data": { "input": input } }));
    }

    let mut message = Map::new();
    let _ = message.insert("kind".into(), json!("message"));
    let _ = message.insert("role".into(), json!("user"));
    let _ = message.insert("messageId".into(), json!(Uuid::now_v7().to_string()));
    let _ = message.insert("parts".into(), Value::Array(parts));
    if let Some(id) = &request.conversation_id {
        let _ = message.insert("contextId".into(), json!(id));
    }
    if let Some(id) = &request.work_id {
        let _ = message.insert("taskId".into(), json!(id));
    }

    let mut params = json!({ "message": Value::Object(message) });
    if let Some(url) = &request.callback_url {
        params["configuration"] = json!({ "pushNotificationConfig": { "url": url } });
    }
    params
}

fn mcp_call_params(request: &TurnRequest) -> Value {
    let mut arguments = match &request.args {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            let _ = map.insert("args".into(), other.clone());
            map
        }
    };
    if let Some(id) = &request.conversation_id {
        let _ = arguments.insert("context_id".into(), json!(id));
    }
    if let Some(id) = &request.work_id {
        let _ = arguments.insert("task_id".into(), json!(id));
    }
    if let Some(input) = &request.input {
        let _ = arguments.insert("input".into(), input.clone());
    }
    if let Some(url) = &request.callback_url {
        let _ = arguments.insert("push_notification_config".into(), json!({ "url": url }));
    }
    json!({ "name": request.operation, "arguments": Value::Object(arguments) })
}

/// Decode a JSON-RPC response into an agent response.
pub fn decode(protocol: AgentProtocol, response: RpcResponse) -> Result<AgentResponse, TransportError> {
    if let Some(err) = response.error {
        return Err(TransportError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    let result = response
        .result
        .ok_or_else(|| TransportError::InvalidResponse("response has neither result nor error".into()))?;
    match protocol {
        AgentProtocol::A2a => decode_a2a(&result),
        AgentProtocol::Mcp => decode_mcp(&result),
    }
}

// ── A2A ──

fn decode_a2a(result: &Value) -> Result<AgentResponse, TransportError> {
    let conversation_id = str_field(result, &["contextId"]).map(ConversationId::from_raw);

    // A bare message is a synchronous answer.
    if result.get("kind").and_then(Value::as_str) == Some("message") {
        let parts = parts_of(result);
        let body = data_body(&parts);
        return Ok(AgentResponse {
            status: TaskState::Completed,
            conversation_id,
            work_id: str_field(result, &["taskId"]).map(WorkId::from_raw),
            body,
        });
    }

    let raw_state = result
        .pointer("/status/state")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::InvalidResponse("task has no status.state".into()))?;
    let work_id = str_field(result, &["id", "taskId"]).map(WorkId::from_raw);
    let message_parts = result
        .pointer("/status/message")
        .map(parts_of)
        .unwrap_or_default();

    if raw_state == "auth-required" {
        let mut error = AgentError::new("AUTH_REQUIRED", text_of(&message_parts).unwrap_or_default());
        error.recovery = Some(Recovery::Terminal);
        return Ok(AgentResponse {
            status: TaskState::Failed,
            conversation_id,
            work_id,
            body: ResponseBody::Error(error),
        });
    }
    let status: TaskState = raw_state
        .parse()
        .map_err(|_| TransportError::InvalidResponse(format!("unknown task state '{raw_state}'")))?;

    let body = match status {
        TaskState::InputRequired => ResponseBody::Question(question_from_parts(&message_parts)),
        TaskState::Failed | TaskState::Rejected | TaskState::Canceled => {
            ResponseBody::Error(error_from_parts(status, &message_parts))
        }
        TaskState::Completed => {
            let mut parts: Vec<Value> = result
                .get("artifacts")
                .and_then(Value::as_array)
                .map(|artifacts| artifacts.iter().flat_map(parts_of).collect())
                .unwrap_or_default();
            if parts.is_empty() {
                parts = message_parts;
            }
            data_body(&parts)
        }
        TaskState::Submitted | TaskState::Working => ResponseBody::Empty,
    };

    Ok(AgentResponse {
        status,
        conversation_id,
        work_id,
        body,
    })
}

fn parts_of(holder: &Value) -> Vec<Value> {
    holder
        .get("parts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn data_parts(parts: &[Value]) -> Vec<&Value> {
    parts
        .iter()
        .filter(|p| p.get("kind").and_then(Value::as_str) == Some("data"))
        .filter_map(|p| p.get("data"))
        .collect()
}

fn text_of(parts: &[Value]) -> Option<String> {
    let texts: Vec<&str> = parts
        .iter()
        .filter(|p| p.get("kind").and_then(Value::as_str) == Some("text"))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    (!texts.is_empty()).then(|| texts.join("\n"))
}

fn data_body(parts: &[Value]) -> ResponseBody {
    let data = data_parts(parts);
    match data.len() {
        0 => match text_of(parts) {
            Some(text) => ResponseBody::Data(Value::String(text)),
            None => ResponseBody::Empty,
        },
        1 => ResponseBody::Data(data[0].clone()),
        _ => ResponseBody::Data(Value::Array(data.into_iter().cloned().collect())),
    }
}

fn question_from_parts(parts: &[Value]) -> InputRequest {
    data_parts(parts)
        .into_iter()
        .find(|d| d.get("question").is_some())
        .and_then(|d| serde_json::from_value(d.clone()).ok())
        .or_else(|| text_of(parts).map(InputRequest::new))
        .unwrap_or_else(|| InputRequest::new("input required"))
}

fn error_from_parts(status: TaskState, parts: &[Value]) -> AgentError {
    if let Some(err) = data_parts(parts)
        .into_iter()
        .find(|d| d.get("code").is_some())
        .and_then(|d| serde_json::from_value::<AgentError>(d.clone()).ok())
    {
        return err;
    }
    let code = match status {
        TaskState::Rejected => codes::TASK_REJECTED,
        TaskState::Canceled => codes::CANCELED,
        _ => codes::TASK_FAILED,
    };
    AgentError::new(code, text_of(parts).unwrap_or_else(|| format!("task {status}")))
}

// ── MCP ──

fn decode_mcp(result: &Value) -> Result<AgentResponse, TransportError> {
    let structured = match result.get("structuredContent") {
        Some(v) if !v.is_null() => v.clone(),
        _ => {
            let text = result
                .get("content")
                .and_then(Value::as_array)
                .and_then(|c| c.iter().find_map(|item| item.get("text").and_then(Value::as_str)))
                .unwrap_or_default();
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_owned()))
        }
    };

    let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
    let status = if is_error {
        TaskState::Failed
    } else {
        match str_field(&structured, &["status"]) {
            Some(raw) => raw
                .parse()
                .map_err(|_| TransportError::InvalidResponse(format!("unknown task state '{raw}'")))?,
            None => TaskState::Completed,
        }
    };

    let conversation_id =
        str_field(&structured, &["context_id", "contextId"]).map(ConversationId::from_raw);
    let work_id = str_field(&structured, &["task_id", "taskId"]).map(WorkId::from_raw);

    let body = match status {
        TaskState::InputRequired => {
            let question = structured
                .get("question")
                .and_then(|q| match q {
                    Value::String(s) => Some(InputRequest::new(s.clone())),
                    _ => serde_json::from_value(q.clone()).ok(),
                })
                .or_else(|| str_field(&structured, &["message"]).map(InputRequest::new))
                .unwrap_or_else(|| InputRequest::new("input required"));
            ResponseBody::Question(question)
        }
        TaskState::Failed | TaskState::Rejected | TaskState::Canceled => {
            let error = structured
                .get("error")
                .or_else(|| structured.get("errors").and_then(|e| e.get(0)))
                .and_then(|e| serde_json::from_value(e.clone()).ok())
                .unwrap_or_else(|| {
                    let message = match &structured {
                        Value::String(s) => s.clone(),
                        other => str_field(other, &["message"]).unwrap_or("tool call failed").to_owned(),
                    };
                    AgentError::new(codes::TASK_FAILED, message)
                });
            ResponseBody::Error(error)
        }
        TaskState::Completed => match structured.get("data") {
            Some(data) => ResponseBody::Data(data.clone()),
            None => ResponseBody::Data(strip_envelope(structured)),
        },
        TaskState::Submitted | TaskState::Working => ResponseBody::Empty,
    };

    Ok(AgentResponse {
        status,
        conversation_id,
        work_id,
        body,
    })
}

fn strip_envelope(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        for key in ["status", "context_id", "contextId", "task_id", "taskId"] {
            let _ = map.remove(key);
        }
    }
    value
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::OperationId;

    fn turn() -> TurnRequest {
        TurnRequest::initial(
            OperationId::from_raw("op_1"),
            "create_plan",
            json!({"brief": "spring launch"}),
        )
    }

    fn rpc(result: Value) -> RpcResponse {
        RpcResponse {
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn a2a_first_turn_has_no_continuation_ids() {
        let agent = AgentConfig::new("a1", "https://a1.test");
        let req = build_send(&agent, &turn().with_callback_url("https://me.test/hook"));
        assert_eq!(req.method, "message/send");
        let msg = &req.params["message"];
        assert!(msg.get("contextId").is_none());
        assert_eq!(msg["parts"][0]["data"]["skill"], "create_plan");
        assert_eq!(
            req.params["configuration"]["pushNotificationConfig"]["url"],
            "https://me.test/hook"
        );
    }

    #[test]
    fn a2a_answer_turn_carries_context_and_input() {
        let agent = AgentConfig::new("a1", "https://a1.test");
        let next = turn().answer(Some(ConversationId::from_raw("c1")), None, json!(50000));
        let req = build_send(&agent, &next);
        assert_eq!(req.params["message"]["contextId"], "c1");
        assert_eq!(req.params["message"]["parts"][1]["data"]["input"], 50000);
    }

    #[test]
    fn mcp_turn_flattens_arguments() {
        let mut agent = AgentConfig::new("a1", "https://a1.test");
        agent.protocol = AgentProtocol::Mcp;
        let next = turn().answer(Some(ConversationId::from_raw("c1")), None, json!("yes"));
        let req = build_send(&agent, &next);
        assert_eq!(req.method, "tools/call");
        assert_eq!(req.params["name"], "create_plan");
        assert_eq!(req.params["arguments"]["brief"], "spring launch");
        assert_eq!(req.params["arguments"]["context_id"], "c1");
        assert_eq!(req.params["arguments"]["input"], "yes");
    }

    #[test]
    fn decode_a2a_completed_task_with_artifact() {
        let resp = decode(
            AgentProtocol::A2a,
            rpc(json!({
                "kind": "task",
                "id": "t1",
                "contextId": "c1",
                "status": {"state": "completed"},
                "artifacts": [{"parts": [{"kind": "data", "data": {"status": "ok"}}]}]
            })),
        )
        .unwrap();
        assert_eq!(resp.status, TaskState::Completed);
        assert_eq!(resp.data(), Some(&json!({"status": "ok"})));
        assert_eq!(resp.conversation_id.unwrap().as_str(), "c1");
    }

    #[test]
    fn decode_a2a_input_required_text_question() {
        let resp = decode(
            AgentProtocol::A2a,
            rpc(json!({
                "id": "t1",
                "contextId": "c1",
                "status": {"state": "input-required",
                           "message": {"parts": [{"kind": "text", "text": "budget?"}]}}
            })),
        )
        .unwrap();
        assert_eq!(resp.question().unwrap().question, "budget?");
    }

    #[test]
    fn decode_a2a_failed_with_structured_error() {
        let resp = decode(
            AgentProtocol::A2a,
            rpc(json!({
                "id": "t1",
                "status": {"state": "failed",
                           "message": {"parts": [{"kind": "data",
                               "data": {"code": "RATE_LIMITED", "message": "slow down"}}]}}
            })),
        )
        .unwrap();
        assert_eq!(resp.error().unwrap().code, "RATE_LIMITED");
    }

    #[test]
    fn decode_a2a_bare_message_is_completed() {
        let resp = decode(
            AgentProtocol::A2a,
            rpc(json!({
                "kind": "message",
                "contextId": "c9",
                "parts": [{"kind": "text", "text": "done"}]
            })),
        )
        .unwrap();
        assert_eq!(resp.status, TaskState::Completed);
        assert_eq!(resp.data(), Some(&json!("done")));
    }

    #[test]
    fn decode_unknown_state_is_invalid_response() {
        let err = decode(AgentProtocol::A2a, rpc(json!({"status": {"state": "dreaming"}})))
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponse(_)));
    }

    #[test]
    fn decode_rpc_error() {
        let err = decode(
            AgentProtocol::A2a,
            RpcResponse {
                result: None,
                error: Some(RpcErrorBody {
                    code: -32601,
                    message: "method not found".into(),
                    data: None,
                }),
            },
        )
        .unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -32601, .. }));
    }

    #[test]
    fn decode_mcp_text_content_with_deferred_status() {
        let resp = decode(
            AgentProtocol::Mcp,
            rpc(json!({
                "content": [{"type": "text",
                             "text": "{\"status\":\"working\",\"task_id\":\"w1\",\"context_id\":\"c1\"}"}]
            })),
        )
        .unwrap();
        assert_eq!(resp.status, TaskState::Working);
        assert_eq!(resp.work_id.unwrap().as_str(), "w1");
        assert_eq!(resp.body, ResponseBody::Empty);
    }

    #[test]
    fn decode_mcp_structured_completion_strips_envelope() {
        let resp = decode(
            AgentProtocol::Mcp,
            rpc(json!({
                "structuredContent": {"status": "completed", "context_id": "c1", "products": [1, 2]}
            })),
        )
        .unwrap();
        assert_eq!(resp.data(), Some(&json!({"products": [1, 2]})));
    }

    #[test]
    fn decode_mcp_is_error() {
        let resp = decode(
            AgentProtocol::Mcp,
            rpc(json!({"isError": true, "content": [{"type": "text", "text": "bad brief"}]})),
        )
        .unwrap();
        assert_eq!(resp.status, TaskState::Failed);
        assert_eq!(resp.error().unwrap().message, "bad brief");
    }
}
