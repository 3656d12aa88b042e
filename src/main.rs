use log::info;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use chanio::{AppConfig, AppState, GpioManager};

#[cfg(feature = "hardware-gpio")]
use chanio::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use chanio::MockGpioBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHANIO_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(
                LibgpiodBackend::new(&config.gpio)
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };

    let manager = Arc::new(GpioManager::new(&config.gpio, backend));
    let app_state = AppState::new(manager, config.gpio.event_capacity);

    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    })
    .client_request_timeout(std::time::Duration::from_secs(config.http.timeout));

    let remove_stale_socket = |socket_path: &str| -> std::io::Result<()> {
        if Path::new(socket_path).exists() {
            fs::remove_file(socket_path)?;
        }
        Ok(())
    };

    let (server, bind_addrs) = match (&config.http.unix_socket, &config.http.host) {
        (Some(socket_path), Some(host)) => {
            remove_stale_socket(socket_path)?;
            (
                server.bind_uds(socket_path)?.bind_auto_h2c(host)?,
                format!("{socket_path} and {host}"),
            )
        }
        (Some(socket_path), None) => {
            remove_stale_socket(socket_path)?;
            (server.bind_uds(socket_path)?, socket_path.clone())
        }
        (None, Some(host)) => (server.bind_auto_h2c(host)?, host.clone()),
        (None, None) => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    server.run().await
}
