use std::net::TcpListener;

use actix_session::storage::RedisSessionStore;
use actix_session::SessionMiddleware;
use actix_web::cookie::Key;
use actix_web::dev::Server;
use actix_web::web;
use actix_web::web::Data;
use actix_web::App;
use actix_web::HttpServer;
use actix_web_lab::middleware::from_fn;
use redis::aio::ConnectionManager;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_actix_web::TracingLogger;

use crate::authentication::reject_anonymous_users;
use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::routes::add_guest_seat;
use crate::routes::admin_deposit;
use crate::routes::cancel;
use crate::routes::create_session;
use crate::routes::get_session;
use crate::routes::health_check;
use crate::routes::list_session_registrations;
use crate::routes::list_sessions;
use crate::routes::log_out;
use crate::routes::my_ledger;
use crate::routes::my_registrations;
use crate::routes::my_wallet;
use crate::routes::patch_guests;
use crate::routes::patch_session;
use crate::routes::request_status;
use crate::routes::submit_registration;
use crate::routes::verify_login;

/// Wrapper for actix's `Server` with access to the bound port (the OS picks
/// one when the configured port is 0, which the test harness relies on).
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let pool = get_connection_pool(&cfg.database);
        let redis = get_redis(&cfg).await?;

        let server = run(listener, pool, redis, cfg).await?;
        Ok(Self { port, server })
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    /// Consumes `self`; either the final call of main or handed to
    /// `tokio::spawn`.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

/// `connect_lazy_with` defers the first connection until the pool is used,
/// so db-free requests (health checks) never touch postgres.
pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> PgPool {
    PgPoolOptions::new().connect_lazy_with(db_cfg.connection())
}

/// One multiplexed connection shared by handlers and workers; it reconnects
/// by itself and clones cheaply.
pub async fn get_redis(cfg: &Settings) -> Result<ConnectionManager, anyhow::Error> {
    let client = redis::Client::open(cfg.redis_uri.expose_secret().as_str())?;
    Ok(ConnectionManager::new(client).await?)
}

/// Declares all API endpoints. The server only listens on an already-bound
/// address.
pub async fn run(
    listener: TcpListener,
    pool: PgPool,
    redis: ConnectionManager,
    cfg: Settings,
) -> Result<Server, anyhow::Error> {
    let secret_key = Key::from(cfg.application.hmac_secret.expose_secret().as_bytes());
    let redis_store = RedisSessionStore::new(cfg.redis_uri.expose_secret()).await?;

    let pool = Data::new(pool);
    let redis = Data::new(redis);
    let cfg = Data::new(cfg);

    // one `App` per worker thread; everything captured must be cloneable
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .wrap(SessionMiddleware::new(
                redis_store.clone(),
                secret_key.clone(),
            ))
            // public surface
            .route("/health_check", web::get().to(health_check))
            .route("/auth/verify", web::post().to(verify_login))
            .route("/auth/logout", web::post().to(log_out))
            .route("/sessions", web::get().to(list_sessions))
            .route("/sessions/{session_id}", web::get().to(get_session))
            .route(
                "/sessions/{session_id}/registrations",
                web::get().to(list_session_registrations),
            )
            // request ids are unguessable capabilities; no auth needed
            .route("/requests/{request_id}/status", web::get().to(request_status))
            // authenticated surface
            .service(
                web::resource("/sessions/{session_id}/register")
                    .wrap(from_fn(reject_anonymous_users))
                    .route(web::post().to(submit_registration)),
            )
            .service(
                web::scope("/me")
                    .wrap(from_fn(reject_anonymous_users))
                    .route("/registrations", web::get().to(my_registrations)),
            )
            .service(
                web::scope("/registrations")
                    .wrap(from_fn(reject_anonymous_users))
                    .route("/{registration_id}/cancel", web::post().to(cancel))
                    .route("/{registration_id}/guests", web::patch().to(patch_guests))
                    .route("/{registration_id}/guests", web::post().to(add_guest_seat)),
            )
            .service(
                web::scope("/wallet")
                    .wrap(from_fn(reject_anonymous_users))
                    .route("/me", web::get().to(my_wallet))
                    .route("/me/ledger", web::get().to(my_ledger)),
            )
            .service(
                web::scope("/admin")
                    .wrap(from_fn(reject_anonymous_users))
                    .route("/sessions", web::post().to(create_session))
                    .route("/sessions/{session_id}", web::patch().to(patch_session))
                    .route("/deposits", web::post().to(admin_deposit)),
            )
            .app_data(pool.clone())
            .app_data(redis.clone())
            .app_data(cfg.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}
