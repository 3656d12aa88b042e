use log::warn;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use actix_web::{HttpRequest, HttpResponse, Responder, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::error::GpioError;
use crate::events::callback;
use crate::gpio::{Channel, Direction, Edge, GpioBackend, Level, NumberingMode, Pull};
use crate::manager::GpioManager;

/// Edge reported by a channel's watcher, as streamed on `/events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EdgeEvent {
    pub id: u32,
    pub channel: Channel,
    pub edge: Edge,
    pub timestamp_ms: u64,
}

pub struct AppState<B: GpioBackend + 'static> {
    pub manager: Arc<GpioManager<B>>,
    pub events: broadcast::Sender<EdgeEvent>,
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn new(manager: Arc<GpioManager<B>>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self { manager, events }
    }
}

impl<B: GpioBackend + 'static> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            events: self.events.clone(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigurePayload {
    direction: String,
    pull: Option<String>,
    initial: Option<String>,
}

#[derive(Deserialize)]
struct EventsPayload {
    edge: String,
    debounce_ms: Option<u64>,
}

#[derive(Deserialize)]
struct EdgeQuery {
    edge: String,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct PwmPayload {
    frequency_hz: Option<f64>,
    duty_cycle: Option<f64>,
}

#[derive(Serialize)]
struct Released {
    released: usize,
}

async fn handle_event_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<EdgeEvent>,
) {
    let mut events = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(Message::Text(_))
                    | Ok(Message::Binary(_))
                    | Ok(Message::Pong(_))
                    | Ok(Message::Continuation(_))
                    | Ok(Message::Nop) => {}
                    Err(_) => break,
                }
            }
            event = events.next() => {
                let Some(event) = event else { break; };

                match event {
                    Ok(event) => {
                        if let Ok(text) = serde_json::to_string(&event)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        if session.text(GpioError::Gpio(format!("Event stream lagged by {n} messages")).to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl<B: GpioBackend + 'static> AppState<B> {
    pub fn api_scope(&self, base_path: &str) -> actix_web::Scope {
        use Method as M;

        web::scope(base_path)
            .service(allow_only(
                web::resource("/channels")
                    .route(web::get().to(list_channels::<B>))
                    .route(web::delete().to(cleanup_all::<B>)),
                &[M::GET, M::DELETE],
            ))
            .service(allow_only(
                web::resource("/mode")
                    .route(web::get().to(get_mode::<B>))
                    .route(web::put().to(set_mode::<B>)),
                &[M::GET, M::PUT],
            ))
            .service(allow_only(
                web::resource("/warnings").route(web::put().to(set_warnings::<B>)),
                &[M::PUT],
            ))
            .service(allow_only(
                web::resource("/events").route(web::get().to(events_ws::<B>)),
                &[M::GET],
            ))
            .service(allow_only(
                web::resource("/channel/{id}")
                    .route(web::put().to(configure::<B>))
                    .route(web::delete().to(cleanup_one::<B>)),
                &[M::PUT, M::DELETE],
            ))
            .service(allow_only(
                web::resource("/channel/{id}/function").route(web::get().to(gpio_function::<B>)),
                &[M::GET],
            ))
            .service(allow_only(
                web::resource("/channel/{id}/value")
                    .route(web::get().to(get_value::<B>))
                    .route(web::post().to(set_value::<B>)),
                &[M::GET, M::POST],
            ))
            .service(allow_only(
                web::resource("/channel/{id}/events")
                    .route(web::put().to(add_event_detect::<B>))
                    .route(web::delete().to(remove_event_detect::<B>)),
                &[M::PUT, M::DELETE],
            ))
            .service(allow_only(
                web::resource("/channel/{id}/events/detected")
                    .route(web::get().to(event_detected::<B>)),
                &[M::GET],
            ))
            .service(allow_only(
                web::resource("/channel/{id}/edge").route(web::get().to(wait_for_edge::<B>)),
                &[M::GET],
            ))
            .service(allow_only(
                web::resource("/channel/{id}/pwm")
                    .route(web::get().to(pwm_status::<B>))
                    .route(web::put().to(start_pwm::<B>))
                    .route(web::patch().to(change_pwm::<B>))
                    .route(web::delete().to(stop_pwm::<B>)),
                &[M::GET, M::PUT, M::PATCH, M::DELETE],
            ))
    }
}

/// Runs a manager call that may join worker threads off the async executor.
async fn blocking<B, T, F>(state: &web::Data<AppState<B>>, f: F) -> Result<T, GpioError>
where
    B: GpioBackend + 'static,
    T: Send + 'static,
    F: FnOnce(&GpioManager<B>) -> Result<T, GpioError> + Send + 'static,
{
    let manager = state.manager.clone();
    web::block(move || f(&manager))
        .await
        .map_err(|e| GpioError::Gpio(format!("blocking task failed: {e}")))?
}

async fn list_channels<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    Ok(web::Json(state.manager.channels()))
}

async fn cleanup_all<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let released = blocking(&state, |m| m.cleanup(None)).await?;
    Ok(web::Json(Released { released }))
}

async fn get_mode<B: GpioBackend + 'static>(
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    Ok(web::Json(state.manager.mode()))
}

async fn set_mode<B: GpioBackend + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let mode: NumberingMode = parse_text_payload(&body)?.parse()?;
    state.manager.set_mode(mode);
    Ok(web::Json(mode))
}

async fn set_warnings<B: GpioBackend + 'static>(
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let enabled = parse_text_payload(&body)?
        .parse::<bool>()
        .map_err(|_| GpioError::InvalidValue("Warnings flag must be true or false".into()))?;
    state.manager.set_warnings(enabled);
    Ok(web::Json(enabled))
}

async fn configure<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let payload: ConfigurePayload = parse_json_payload(&body)?;
    let direction: Direction = payload.direction.parse()?;
    let pull = payload
        .pull
        .as_deref()
        .map(str::parse::<Pull>)
        .transpose()?
        .unwrap_or_default();
    let initial = payload
        .initial
        .as_deref()
        .map(str::parse::<Level>)
        .transpose()?;

    blocking(&state, move |m| m.configure(id, direction, pull, initial)).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn cleanup_one<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let released = blocking(&state, move |m| m.cleanup(Some(id))).await?;
    Ok(web::Json(Released { released }))
}

async fn gpio_function<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    Ok(web::Json(state.manager.gpio_function(id)?))
}

async fn get_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let level = blocking(&state, move |m| m.read(id)).await?;
    Ok(web::Json(level.as_u8()))
}

async fn set_value<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let level: Level = parse_text_payload(&body)?.parse()?;
    blocking(&state, move |m| m.write(id, level)).await?;
    Ok(HttpResponse::Ok())
}

async fn add_event_detect<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let payload: EventsPayload = parse_json_payload(&body)?;
    let edge: Edge = payload.edge.parse()?;
    let debounce = payload.debounce_ms.map(Duration::from_millis);

    let tx = state.events.clone();
    let forward = callback(move |channel| {
        // no subscribers is not a failure
        let _ = tx.send(EdgeEvent {
            id,
            channel,
            edge,
            timestamp_ms: now_ms(),
        });
        Ok(())
    });

    state
        .manager
        .add_event_detect(id, edge, Some(forward), debounce)?;
    Ok(HttpResponse::NoContent().finish())
}

async fn remove_event_detect<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    blocking(&state, move |m| m.remove_event_detect(id)).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn event_detected<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    Ok(web::Json(state.manager.event_detected(id)?))
}

async fn wait_for_edge<B: GpioBackend + 'static>(
    req: HttpRequest,
    query: web::Query<EdgeQuery>,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let edge: Edge = query.edge.parse()?;
    let timeout = query.timeout_ms.map(Duration::from_millis);

    let outcome = blocking(&state, move |m| m.wait_for_edge(id, edge, timeout)).await?;
    Ok(web::Json(outcome))
}

async fn pwm_status<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    Ok(web::Json(state.manager.existing_pwm(id)?.status()?))
}

async fn start_pwm<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let payload: PwmPayload = parse_json_payload(&body)?;
    let frequency_hz = payload
        .frequency_hz
        .ok_or_else(|| GpioError::InvalidValue("frequency_hz is required".into()))?;
    let duty_cycle = payload.duty_cycle.unwrap_or(0.0);

    let status = blocking(&state, move |m| {
        let pwm = m.pwm(id, frequency_hz)?;
        if let Err(e) = pwm.start(duty_cycle) {
            pwm.close()?;
            return Err(e);
        }
        pwm.status()
    })
    .await?;
    Ok(web::Json(status))
}

async fn change_pwm<B: GpioBackend + 'static>(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    let payload: PwmPayload = parse_json_payload(&body)?;

    let status = blocking(&state, move |m| {
        let pwm = m.existing_pwm(id)?;
        if let Some(frequency_hz) = payload.frequency_hz {
            pwm.change_frequency(frequency_hz)?;
        }
        if let Some(duty_cycle) = payload.duty_cycle {
            pwm.change_duty_cycle(duty_cycle)?;
        }
        pwm.status()
    })
    .await?;
    Ok(web::Json(status))
}

async fn stop_pwm<B: GpioBackend + 'static>(
    req: HttpRequest,
    state: web::Data<AppState<B>>,
) -> Result<impl Responder, GpioError> {
    let id = parse_channel_id(&req)?;
    blocking(&state, move |m| m.existing_pwm(id)?.close()).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn events_ws<B: GpioBackend + 'static>(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState<B>>,
) -> Result<HttpResponse, GpioError> {
    let rx = state.events.subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| GpioError::Gpio(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_event_websocket(session, client_stream, rx).await;
    });

    Ok(response)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn parse_text_payload(body: &[u8]) -> Result<&str, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty payload".into()));
    }

    std::str::from_utf8(body)
        .map(|text| text.trim().trim_matches('"'))
        .map_err(|_| GpioError::InvalidValue("Payload must be valid UTF-8".into()))
}

fn parse_json_payload<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, GpioError> {
    if body.is_empty() {
        return Err(GpioError::InvalidValue("Empty payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| GpioError::InvalidValue(format!("Invalid payload: {e}")))
}

fn parse_channel_id(req: &HttpRequest) -> Result<u32, GpioError> {
    let id = req
        .match_info()
        .get("id")
        .ok_or_else(|| GpioError::InvalidValue("Missing channel id".into()))?;
    let id = id
        .parse::<u32>()
        .map_err(|_| GpioError::InvalidValue("Invalid channel id".into()))?;

    Ok(id)
}

/// Answers every method not in `methods` with 405.
fn allow_only(resource: actix_web::Resource, methods: &[Method]) -> actix_web::Resource {
    resource.route(
        web::route()
            .guard(guard_not_methods(methods))
            .to(method_not_allowed),
    )
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard + use<> {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
