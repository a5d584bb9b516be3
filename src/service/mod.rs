//! NDJSON actor-protocol service.
//!
//! Translates newline-delimited JSON packets into calls on a
//! [`DirectorActor`] and the instrumenters it owns. Every packet names the
//! actor it is addressed `to` and the request `type`; responses echo the
//! request id and the answering actor. Events queued on the connection while
//! a packet is handled are written before its response, in emission order.
//! Packets are processed sequentially.

use crate::PROTOCOL_VERSION;
use crate::runtime::director::DirectorActor;
use crate::runtime::error::{DirectorError, InstrumenterError, SandboxError};
use crate::runtime::ids::ActorId;
use crate::runtime::instrumenter::InstrumenterActor;
use crate::runtime::transport::BufferedConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// Address of the pseudo-actor that answers the handshake
pub const ROOT_ACTOR: &str = "root";

/// Service entry point: wraps one director and the connection its actors emit on.
pub struct Service {
    director: Arc<DirectorActor>,
    connection: Arc<BufferedConnection>,
    handshake_completed: bool,
}

impl Service {
    /// Create a service for `director`, whose attachment uses `connection`.
    pub fn new(director: Arc<DirectorActor>, connection: Arc<BufferedConnection>) -> Self {
        Self {
            director,
            connection,
            handshake_completed: false,
        }
    }

    /// The director served by this connection.
    pub fn director(&self) -> &Arc<DirectorActor> {
        &self.director
    }

    /// Consume packets from the reader until EOF, writing one JSON value per line.
    pub fn run<R: BufRead, W: Write>(&mut self, reader: R, mut writer: W) -> io::Result<()> {
        for line in reader.lines() {
            let line = line?;
            for packet in self.process_line(&line) {
                serde_json::to_writer(&mut writer, &packet)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }

        Ok(())
    }

    /// Handle one input line and return the packets to send back.
    pub fn process_line(&mut self, line: &str) -> Vec<Value> {
        if line.trim().is_empty() {
            return Vec::new();
        }

        let response = match serde_json::from_str::<RequestEnvelope>(line) {
            Ok(request) => self.handle_request(request),
            Err(err) => Some(ResponseEnvelope::from_error(
                Value::Null,
                ROOT_ACTOR.to_string(),
                ServiceError::Parse(err.to_string()),
            )),
        };

        let mut packets: Vec<Value> = self
            .connection
            .drain_events()
            .into_iter()
            .map(|event| json!({ "from": event.from, "type": event.kind, "data": event.data }))
            .collect();
        if let Some(response) = response {
            packets.push(serde_json::to_value(response).unwrap_or(Value::Null));
        }
        packets
    }

    fn handle_request(&mut self, request: RequestEnvelope) -> Option<ResponseEnvelope> {
        match self.dispatch(&request.to, &request.kind, &request.params) {
            Ok(Some(value)) => Some(ResponseEnvelope::success(request.id, request.to, value)),
            Ok(None) => None,
            Err(err) => Some(ResponseEnvelope::from_error(request.id, request.to, err)),
        }
    }

    fn dispatch(&mut self, to: &str, kind: &str, params: &Value) -> Result<Option<Value>, ServiceError> {
        if to == ROOT_ACTOR {
            return match kind {
                "handshake" => self.cmd_handshake(params).map(Some),
                other => Err(ServiceError::Unsupported(other.to_string())),
            };
        }

        self.ensure_handshake()?;

        let actor = ActorId::parse(to).ok_or_else(|| ServiceError::NoSuchActor(to.to_string()))?;
        if &actor == self.director.actor_id() {
            return self.dispatch_director(kind, params);
        }

        let instrumenter = self
            .director
            .instrumenter_by_actor(&actor)
            .ok_or_else(|| ServiceError::NoSuchActor(to.to_string()))?;
        self.dispatch_instrumenter(&instrumenter, kind, params)
    }

    fn dispatch_director(&mut self, kind: &str, params: &Value) -> Result<Option<Value>, ServiceError> {
        match kind {
            "install" => self.cmd_install(params).map(Some),
            "uninstall" => {
                let id = required_str(params, "id")?;
                self.director.uninstall(id)?;
                Ok(Some(json!({})))
            }
            "list" => Ok(Some(json!({ "instrumenters": self.director.list_forms() }))),
            "finalize" => {
                self.director.finalize();
                Ok(None)
            }
            other => Err(ServiceError::Unsupported(other.to_string())),
        }
    }

    fn dispatch_instrumenter(
        &mut self,
        instrumenter: &InstrumenterActor,
        kind: &str,
        params: &Value,
    ) -> Result<Option<Value>, ServiceError> {
        match kind {
            "activate" => {
                instrumenter.activate(optional_bool(params, "reload")?)?;
                Ok(None)
            }
            "deactivate" => {
                instrumenter.deactivate(optional_bool(params, "reload")?)?;
                Ok(None)
            }
            "sendEvent" => {
                let name = required_str(params, "name")?;
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                instrumenter.send_event(name, &data)?;
                Ok(None)
            }
            "callMethod" => {
                let name = required_str(params, "name")?;
                let args = match params.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(args)) => args.clone(),
                    Some(_) => return Err(ServiceError::invalid_param("args")),
                };
                let data = instrumenter.call_method(name, &args)?;
                Ok(Some(json!({ "data": data })))
            }
            // keeps the director registry free of destroyed instrumenters
            "finalize" => {
                self.director.uninstall(instrumenter.id())?;
                Ok(None)
            }
            other => Err(ServiceError::Unsupported(other.to_string())),
        }
    }

    fn cmd_handshake(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let client = required_str(params, "client")?;
        let requested = required_str(params, "protocol_version")?;

        if requested != PROTOCOL_VERSION {
            return Err(ServiceError::Protocol(format!(
                "unsupported protocol version: expected {}, got {}",
                PROTOCOL_VERSION, requested
            )));
        }

        self.handshake_completed = true;
        tracing::debug!(client, "handshake completed");

        Ok(json!({
            "protocol_version": PROTOCOL_VERSION,
            "version": crate::VERSION,
            "client": client,
            "director": self.director.form(),
        }))
    }

    fn cmd_install(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let id = match params.get("id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id.clone()),
            Some(_) => return Err(ServiceError::invalid_param("id")),
        };
        let source = required_str(params, "source")?.to_string();
        let options = match params.get("options") {
            None | Some(Value::Null) => None,
            Some(options) => Some(options.clone()),
        };

        let instrumenter = self.director.install(id, source, options)?;
        Ok(json!({ "instrumenter": instrumenter.form() }))
    }

    fn ensure_handshake(&self) -> Result<(), ServiceError> {
        if self.handshake_completed {
            Ok(())
        } else {
            Err(ServiceError::Protocol(
                "handshake required before issuing requests".into(),
            ))
        }
    }
}

fn required_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, ServiceError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ServiceError::invalid_param(name))
}

fn optional_bool(params: &Value, name: &str) -> Result<bool, ServiceError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(ServiceError::invalid_param(name)),
    }
}

#[derive(Debug)]
enum ServiceError {
    Parse(String),
    InvalidParams(String),
    Unsupported(String),
    Protocol(String),
    NoSuchActor(String),
    Director(DirectorError),
}

impl ServiceError {
    fn invalid_param(name: &str) -> Self {
        ServiceError::InvalidParams(format!("missing or invalid parameter: {}", name))
    }
}

impl From<DirectorError> for ServiceError {
    fn from(err: DirectorError) -> Self {
        ServiceError::Director(err)
    }
}

impl From<InstrumenterError> for ServiceError {
    fn from(err: InstrumenterError) -> Self {
        ServiceError::Director(DirectorError::Instrumenter(err))
    }
}

#[derive(Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    id: Value,
    to: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    id: Value,
    from: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl ResponseEnvelope {
    fn success(id: Value, from: String, result: Value) -> Self {
        Self {
            id,
            from,
            result: Some(result),
            error: None,
        }
    }

    fn from_error(id: Value, from: String, error: ServiceError) -> Self {
        Self {
            id,
            from,
            result: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: String,
    message: String,
}

impl From<ServiceError> for ErrorEnvelope {
    fn from(error: ServiceError) -> Self {
        let (code, message) = match error {
            ServiceError::Parse(message) => ("parseError", message),
            ServiceError::InvalidParams(message) => ("badParameters", message),
            ServiceError::Unsupported(kind) => (
                "unrecognizedPacketType",
                format!("Packet type '{kind}' is not supported by this actor"),
            ),
            ServiceError::Protocol(message) => ("protocolError", message),
            ServiceError::NoSuchActor(actor) => ("noSuchActor", format!("No such actor: {actor}")),
            ServiceError::Director(err) => (director_code(&err), err.to_string()),
        };

        ErrorEnvelope {
            code: code.to_string(),
            message,
        }
    }
}

fn director_code(err: &DirectorError) -> &'static str {
    match err {
        DirectorError::NotFound(_) => "notFound",
        DirectorError::DuplicateId(_) => "duplicateId",
        DirectorError::LimitReached(_) => "limitReached",
        DirectorError::Detached => "detached",
        DirectorError::Instrumenter(err) => match err {
            InstrumenterError::AlreadyActive(_) => "alreadyActive",
            InstrumenterError::NotActive(_) => "notActive",
            InstrumenterError::Destroyed(_) => "destroyed",
            InstrumenterError::MethodNotFound { .. } => "methodNotFound",
            InstrumenterError::SandboxInvocation { .. } => "sandboxInvocationError",
            InstrumenterError::Sandbox(SandboxError::EmptySource) => "emptySource",
            InstrumenterError::Sandbox(_) => "sandboxError",
            InstrumenterError::Page(_) => "pageError",
        },
    }
}
