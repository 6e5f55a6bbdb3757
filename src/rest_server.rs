use crate::broker::ConnectionState;
use crate::classifier::{EventStore, DEFAULT_QUERY_LIMIT};
use crate::commands::DeviceCommand;
use crate::config::Config;
use crate::error::{RelayError, StorageError};
use crate::fanout::{LiveSubscription, SubscriptionFilter};
use crate::models::{EventEnvelope, EventType, TelemetryRecord};
use crate::relay::TelemetryRelay;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Header, Status};
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::{Json, Value};
use rocket::serde::{Deserialize, Serialize};
use rocket::{get, post, routes, Build, Rocket, Shutdown, State};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, warn};

/// Telemetry submission payload. `payload` is stored as its JSON text.
#[derive(Deserialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
struct IngestRequest {
    device_id: String,
    payload: Value,
}

#[derive(Deserialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
struct CommandRequest {
    device_id: String,
    command: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
struct CommandResponse {
    message: String,
    command: DeviceCommand,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde", rename_all = "camelCase")]
struct EventCountResponse {
    event_type: EventType,
    count: u64,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct HealthResponse {
    status: &'static str,
    broker: ConnectionState,
    subscribers: usize,
}

/// CORS Fairing for Rocket
pub struct Cors {
    origin: String,
}

impl Cors {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
        }
    }
}

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(Header::new("Access-Control-Allow-Origin", self.origin.clone()));
        res.set_header(Header::new("Access-Control-Allow-Methods", "GET, POST"));
        res.set_header(Header::new("Access-Control-Allow-Headers", "Content-Type"));
    }
}

fn error_status(e: &RelayError) -> Status {
    match e {
        RelayError::NotConnected => Status::ServiceUnavailable,
        RelayError::NotFound(_) => Status::NotFound,
        RelayError::InvalidRequest(_) | RelayError::Parse(_) => Status::BadRequest,
        RelayError::Broker(_) => Status::BadGateway,
        RelayError::Storage(_) => {
            error!("Storage failure while serving request: {}", e);
            Status::InternalServerError
        }
    }
}

fn storage_status(e: StorageError) -> Status {
    error_status(&RelayError::Storage(e))
}

fn event_store(relay: &TelemetryRelay) -> Result<&Arc<dyn EventStore>, Status> {
    relay.events().ok_or(Status::ServiceUnavailable)
}

fn parse_event_type(value: &str) -> Result<EventType, Status> {
    EventType::from_subject(value).ok_or(Status::BadRequest)
}

fn parse_instant(value: &str) -> Result<OffsetDateTime, Status> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| {
        warn!("Rejected timestamp '{}': {}", value, e);
        Status::BadRequest
    })
}

/// Accept a telemetry record for a device
#[post("/telemetry", data = "<body>")]
async fn ingest_telemetry(
    body: Json<IngestRequest>,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<(Status, Json<TelemetryRecord>), Status> {
    let body = body.into_inner();
    relay
        .ingestion()
        .ingest(&body.device_id, body.payload.to_string())
        .await
        .map(|record| (Status::Created, Json(record)))
        .map_err(|e| error_status(&e))
}

/// Get the most recent records of a device, newest first
#[get("/telemetry/device/<device_id>?<limit>")]
fn device_telemetry(
    device_id: &str,
    limit: Option<usize>,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<Json<Vec<TelemetryRecord>>, Status> {
    relay
        .ingestion()
        .read_recent(device_id, limit)
        .map(Json)
        .map_err(|e| error_status(&e))
}

fn live_events(mut live: LiveSubscription, mut shutdown: Shutdown) -> EventStream![] {
    debug!("Event stream opened for subscription {}.", live.id());
    EventStream! {
        loop {
            let record = tokio::select! {
                record = live.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
                _ = &mut shutdown => break,
            };
            yield Event::json(&record);
        }
    }
}

/// Live records of one device as server-sent events
#[get("/telemetry/device/<device_id>/stream")]
fn device_stream(
    device_id: &str,
    relay: &State<Arc<TelemetryRelay>>,
    shutdown: Shutdown,
) -> EventStream![] {
    let live = relay
        .registry()
        .open(SubscriptionFilter::Device(device_id.to_string()));
    live_events(live, shutdown)
}

/// Live records of every device as server-sent events
#[get("/telemetry/stream")]
fn telemetry_stream(relay: &State<Arc<TelemetryRelay>>, shutdown: Shutdown) -> EventStream![] {
    live_events(relay.registry().open(SubscriptionFilter::All), shutdown)
}

/// Publish a command to a device
#[post("/commands", data = "<body>")]
async fn send_command(
    body: Json<CommandRequest>,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<Json<CommandResponse>, Status> {
    let command = relay
        .commands()
        .send_command(&body.device_id, &body.command)
        .await
        .map_err(|e| error_status(&e))?;
    Ok(Json(CommandResponse {
        message: "Command sent".to_string(),
        command,
    }))
}

#[get("/health")]
fn health(relay: &State<Arc<TelemetryRelay>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        broker: relay.broker().state(),
        subscribers: relay.registry().len(),
    })
}

#[get("/events/type/<event_type>?<limit>")]
fn events_by_type(
    event_type: &str,
    limit: Option<usize>,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<Json<Vec<EventEnvelope>>, Status> {
    let store = event_store(relay)?;
    let event_type = parse_event_type(event_type)?;
    store
        .events_by_type(event_type, limit.unwrap_or(DEFAULT_QUERY_LIMIT))
        .map(Json)
        .map_err(storage_status)
}

#[get("/events/type/<event_type>/count")]
fn count_by_type(
    event_type: &str,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<Json<EventCountResponse>, Status> {
    let store = event_store(relay)?;
    let event_type = parse_event_type(event_type)?;
    let count = store.count_by_type(event_type).map_err(storage_status)?;
    Ok(Json(EventCountResponse { event_type, count }))
}

#[get("/events/device/<device_id>?<limit>")]
fn events_by_device(
    device_id: &str,
    limit: Option<usize>,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<Json<Vec<EventEnvelope>>, Status> {
    event_store(relay)?
        .events_by_device(device_id, limit.unwrap_or(DEFAULT_QUERY_LIMIT))
        .map(Json)
        .map_err(storage_status)
}

/// Events within `[from, to]`, both RFC 3339
#[get("/events?<from>&<to>&<limit>")]
fn events_by_date_range(
    from: &str,
    to: &str,
    limit: Option<usize>,
    relay: &State<Arc<TelemetryRelay>>,
) -> Result<Json<Vec<EventEnvelope>>, Status> {
    let store = event_store(relay)?;
    let (start, end) = (parse_instant(from)?, parse_instant(to)?);
    if start > end {
        return Err(Status::BadRequest);
    }
    store
        .events_by_date_range(start, end, limit.unwrap_or(DEFAULT_QUERY_LIMIT))
        .map(Json)
        .map_err(storage_status)
}

pub fn build_rocket(relay: Arc<TelemetryRelay>, config: &Config) -> Rocket<Build> {
    let figment = rocket::Config::figment()
        .merge(("address", "0.0.0.0"))
        .merge(("port", config.http_port));

    rocket::custom(figment)
        .manage(relay)
        .mount(
            "/",
            routes![
                ingest_telemetry,
                device_telemetry,
                device_stream,
                telemetry_stream,
                send_command,
                health,
                events_by_type,
                count_by_type,
                events_by_device,
                events_by_date_range,
            ],
        )
        .attach(Cors::new(config.cors_origin.clone()))
}

/// Run the Rocket server until it is shut down
pub async fn run_rest_server(relay: Arc<TelemetryRelay>, config: Config) {
    if let Err(e) = build_rocket(relay, &config).launch().await {
        error!("REST server failed: {}", e);
    }
}
