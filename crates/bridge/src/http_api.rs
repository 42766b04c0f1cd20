//! HTTP control API.
//!
//! Players are created, driven and inspected over JSON endpoints; the
//! renderer fetches audio from each player's own listener, not from here.
//!
//! Routes:
//!   GET    /health
//!   GET    /players
//!   POST   /players
//!   DELETE /players/{index}
//!   GET    /players/{index}/status
//!   POST   /players/{index}/play
//!   POST   /players/{index}/stop
//!   POST   /players/{index}/flush
//!   POST   /players/{index}/volume
//!   POST   /players/{index}/fade

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use render_bridge_types::{CodecId, EncodeMode, FadeMode, SampleFormat, TrackMetadata};
use render_pipeline::{PlayerHandle, PlayerRegistry, StreamDescriptor};
use tiny_http::{Header, Method, Response, Server, StatusCode};

use crate::config::BridgeConfig;
use crate::runtime;

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(serde::Serialize)]
struct PlayerInfo {
    index: usize,
    audio_port: u16,
}

#[derive(serde::Serialize)]
struct PlayersResponse {
    players: Vec<PlayerInfo>,
}

#[derive(serde::Deserialize)]
struct PlayRequest {
    source: String,
    /// Protocol codec character; guessed from the source when omitted.
    codec: Option<char>,
    #[serde(default)]
    thru: bool,
    #[serde(default)]
    framing: Option<String>,
    #[serde(default)]
    threshold: usize,
    #[serde(default)]
    cont_wait: bool,
    #[serde(default)]
    icy_interval: usize,
    #[serde(default)]
    metadata: TrackMetadata,
}

#[derive(serde::Deserialize)]
struct VolumeRequest {
    /// Linear gain, 1.0 = unity.
    gain: f64,
    #[serde(default)]
    replay_gain: Option<f64>,
}

#[derive(serde::Deserialize)]
struct FadeRequest {
    mode: FadeMode,
    #[serde(default)]
    duration_ms: u32,
}

pub(crate) fn spawn_http_server(
    bind: SocketAddr,
    registry: Arc<PlayerRegistry>,
    config: BridgeConfig,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let server = match Server::http(bind) {
            Ok(server) => server,
            Err(e) => {
                tracing::error!(error = %e, "http server bind failed");
                return;
            }
        };
        tracing::info!(bind = %bind, "control api listening");

        for mut request in server.incoming_requests() {
            let method = request.method().clone();
            let url = request.url().split('?').next().unwrap_or("").to_string();
            let (status, response) = route(&mut request, &method, &url, &registry, &config);
            let response =
                response.with_header(Header::from_bytes("Content-Type", "application/json").unwrap());
            if should_log_path(&url) {
                tracing::info!(method = %method, path = %url, status, "http request");
            }
            let _ = request.respond(response);
        }
    })
}

type JsonResponse = (u16, Response<std::io::Cursor<Vec<u8>>>);

fn route(
    request: &mut tiny_http::Request,
    method: &Method,
    url: &str,
    registry: &Arc<PlayerRegistry>,
    config: &BridgeConfig,
) -> JsonResponse {
    match (method, url) {
        (Method::Get, "/health") => json_response(
            200,
            &HealthResponse {
                status: "ok",
                version: env!("CARGO_PKG_VERSION"),
            },
        ),
        (Method::Get, "/players") => {
            let players = registry
                .active_handles()
                .into_iter()
                .filter_map(|h| {
                    registry.get(h).ok().map(|p| PlayerInfo {
                        index: h.index(),
                        audio_port: p.port(),
                    })
                })
                .collect();
            json_response(200, &PlayersResponse { players })
        }
        (Method::Post, "/players") => match registry.allocate(config.pipeline()) {
            Ok(handle) => {
                let port = registry.get(handle).map(|p| p.port()).unwrap_or(0);
                json_response(
                    201,
                    &PlayerInfo {
                        index: handle.index(),
                        audio_port: port,
                    },
                )
            }
            Err(e) => error_response(503, &format!("{e}")),
        },
        _ => route_player(request, method, url, registry),
    }
}

fn route_player(
    request: &mut tiny_http::Request,
    method: &Method,
    url: &str,
    registry: &Arc<PlayerRegistry>,
) -> JsonResponse {
    let Some((handle, action)) = parse_player_path(url, registry) else {
        return error_response(404, "not found");
    };
    let player = match registry.get(handle) {
        Ok(p) => p,
        Err(e) => return error_response(404, &format!("{e}")),
    };

    match (method, action) {
        (Method::Delete, "") => match registry.release(handle) {
            Ok(()) => no_content(),
            Err(e) => error_response(404, &format!("{e}")),
        },
        (Method::Get, "status") => json_response(200, &player.snapshot()),
        (Method::Post, "play") => {
            let req: PlayRequest = match read_json(request) {
                Ok(r) => r,
                Err(resp) => return resp,
            };
            let source = match runtime::parse_source(&req.source) {
                Ok(s) => s,
                Err(e) => return error_response(400, &format!("{e:#}")),
            };
            let codec = match req
                .codec
                .map_or_else(|| runtime::guess_codec(&req.source), CodecId::from_char)
            {
                Some(c) => c,
                None => return error_response(400, "codec not given and not guessable"),
            };
            let framing = match req.framing.as_deref().map(runtime::parse_framing) {
                Some(Ok(f)) => f,
                Some(Err(e)) => return error_response(400, &format!("{e}")),
                None => Default::default(),
            };
            let descriptor = StreamDescriptor {
                source,
                codec,
                format: SampleFormat::default(),
                encode_mode: if req.thru { EncodeMode::Thru } else { EncodeMode::Pcm },
                framing,
                threshold: req.threshold,
                cont_wait: req.cont_wait,
                icy_interval: req.icy_interval,
                metadata: req.metadata,
            };
            match player.open_stream(descriptor) {
                Ok(()) => no_content(),
                Err(e) => error_response(409, &format!("{e}")),
            }
        }
        (Method::Post, "stop") => {
            player.request_stop();
            no_content()
        }
        (Method::Post, "flush") => {
            player.request_flush();
            no_content()
        }
        (Method::Post, "volume") => {
            let req: VolumeRequest = match read_json(request) {
                Ok(r) => r,
                Err(resp) => return resp,
            };
            player.set_volume(req.gain);
            if let Some(rg) = req.replay_gain {
                player.set_replay_gain(rg);
            }
            no_content()
        }
        (Method::Post, "fade") => {
            let req: FadeRequest = match read_json(request) {
                Ok(r) => r,
                Err(resp) => return resp,
            };
            player.set_fade(req.mode, req.duration_ms);
            no_content()
        }
        _ => error_response(404, "not found"),
    }
}

/// `/players/{index}` or `/players/{index}/{action}`.
fn parse_player_path<'a>(
    url: &'a str,
    registry: &Arc<PlayerRegistry>,
) -> Option<(PlayerHandle, &'a str)> {
    let rest = url.strip_prefix("/players/")?;
    let (index_str, action) = match rest.split_once('/') {
        Some((i, a)) => (i, a),
        None => (rest, ""),
    };
    let index: usize = index_str.parse().ok()?;
    let handle = registry
        .active_handles()
        .into_iter()
        .find(|h| h.index() == index)?;
    Some((handle, action))
}

fn read_json<T: serde::de::DeserializeOwned>(
    request: &mut tiny_http::Request,
) -> std::result::Result<T, JsonResponse> {
    let mut body = String::new();
    if let Err(e) = request.as_reader().read_to_string(&mut body) {
        return Err(error_response(400, &format!("read body failed: {e}")));
    }
    serde_json::from_str(&body).map_err(|e| error_response(400, &format!("invalid json: {e}")))
}

fn json_response<T: serde::Serialize>(status: u16, body: &T) -> JsonResponse {
    match serde_json::to_vec(body) {
        Ok(json) => (
            status,
            Response::from_data(json).with_status_code(StatusCode(status)),
        ),
        Err(e) => (
            500,
            Response::from_string(format!("json encode error: {e}"))
                .with_status_code(StatusCode(500)),
        ),
    }
}

fn no_content() -> JsonResponse {
    (
        204,
        Response::from_data(Vec::new()).with_status_code(StatusCode(204)),
    )
}

fn error_response(status: u16, message: &str) -> JsonResponse {
    let body = serde_json::json!({ "error": message });
    (
        status,
        Response::from_data(body.to_string()).with_status_code(StatusCode(status)),
    )
}

fn should_log_path(path: &str) -> bool {
    !(path == "/health" || path.ends_with("/status"))
}
