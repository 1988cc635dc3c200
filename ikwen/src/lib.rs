//! # ikwen: multi-tenant platform for hosted services
//!
//! `ikwen` hosts many *services* (tenants) on one deployment. Each service has its own members,
//! groups and permissions, sells subscriptions to its members, collects payments through mobile
//! money operators, and keeps its community engaged with mail campaigns.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────────────────── HTTP ─────────────────────────────┐
//!             │ /authentication/*   /api/v1/*   /webhooks/mobile-money/*      │
//!             └───────────────┬───────────────────────────────┬───────────────┘
//!                             ↓                               ↓
//!                 ┌────────────────────┐            ┌───────────────────┐
//!                 │ api::handlers      │ ─────────→ │ billing::Payer    │
//!                 │ (tenant scoped)    │            │ mobile_money::    │
//!                 └─────────┬──────────┘            │   Collector       │
//!                           ↓                       └─────────┬─────────┘
//!                 ┌────────────────────┐                      ↓
//!                 │ db::handlers       │ ←──── scheduled jobs (leader only):
//!                 │ db::router         │       invoicing, revivals, pollers
//!                 └────────────────────┘
//! ```
//!
//! - **Access control** ([`auth`], [`api::handlers::members`], [`api::handlers::groups`]):
//!   registration, sessions, password recovery, staff groups and per-member permissions.
//! - **Core** ([`db`], [`api::handlers::services`], [`api::handlers::config`]): services, their
//!   configuration and the database router that sends each tenant to its own database.
//! - **Billing** ([`billing`], [`mobile_money`]): products, subscriptions, invoices, payments and
//!   the daily invoicing jobs. Mobile money transactions are polled until the operator settles them.
//! - **Revival** ([`revival`]): profile tags and the mail campaigns sent to members sharing them.
//!
//! ## Tenancy
//!
//! Requests name their service with the `X-Ikwen-Service` header, falling back to
//! `default_service_id`. Handlers only ever see entities of that service; entities of other
//! services answer 404.
//!
//! ## Running
//!
//! ```bash
//! ikwen -f config.yaml
//! ```
//!
//! The API is documented at `/docs` once the server is up.

pub mod api;
pub mod auth;
pub mod billing;
pub mod config;
pub mod db;
mod email;
pub mod errors;
mod leader_election;
pub mod mobile_money;
pub mod notifier;
mod openapi;
pub mod revival;
mod sms;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use axum::{
    Json, Router,
    http::{self, HeaderValue},
    routing::{get, post, put},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use chrono::{DateTime, Days, NaiveTime, Utc};
use sqlx::{Executor, PgPool};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info, warn};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;
pub use types::{GroupId, InvoiceId, MemberId, ProductId, ServiceId, SubscriptionId};

use crate::{
    api::handlers::{
        auth as auth_handlers, config as config_handlers, cyclic_revivals, events, groups, invoices, members, mobile_money as mobile_money_handlers,
        payment_means, products, profile_tags, revivals, services, subscriptions,
    },
    auth::{password, utils::compose_full_name},
    billing::{Invoicing, Payer},
    config::CorsOrigin,
    db::{
        handlers::{Groups, Members, Repository, Services},
        models::{groups::SUDO_GROUP, members::MemberCreateDBRequest},
        router::{DbRouter, PoolMetricsConfig, run_pool_metrics_sampler},
    },
    email::EmailService,
    errors::Error,
    mobile_money::Collector,
    notifier::Notifier,
    openapi::ApiDoc,
    revival::RevivalJobs,
    sms::SmsGateway,
};

/// Advisory lock held by the replica that runs the scheduled jobs
const LEADER_LOCK_ID: i64 = 0x494b_5745_4e4a_4f42;

/// How often replicas check (or renew) leadership
const LEADER_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Application state shared across all request handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: DbRouter,
    pub config: Config,
    pub notifier: Notifier,
    pub payer: Payer,
    pub collector: Collector,
}

impl AppState {
    /// Build the state and the services hanging off it. Work they spawn stops on `shutdown`.
    pub fn new(db: DbRouter, config: Config, shutdown: CancellationToken) -> Result<Self, Error> {
        let email = Arc::new(EmailService::new(&config)?);
        let sms = SmsGateway::new(&config.sms)?;
        let notifier = Notifier::new(email, sms, TaskTracker::new());
        let payer = Payer::new(db.clone(), notifier.clone());
        let collector = Collector::new(db.clone(), payer.clone(), &config, shutdown)?;

        Ok(Self::builder()
            .db(db)
            .config(config)
            .notifier(notifier)
            .payer(payer)
            .collector(collector)
            .build())
    }
}

/// Get the ikwen database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Create the platform superuser, or promote the existing member with that email.
///
/// Runs on every startup. When `password` is set, it replaces the member's password. When
/// `home_service` exists, the superuser is placed in its `Sudo` group.
pub async fn create_superuser(email: &str, password: Option<&str>, home_service: Option<ServiceId>, db: &PgPool) -> Result<MemberId, Error> {
    let email = email.trim().to_lowercase();
    let password_hash = password.map(password::hash_string).transpose()?;

    let mut tx = db.begin().await.map_err(db::errors::DbError::from)?;
    let existing = Members::new(&mut tx).get_by_email(&email).await?;

    let member_id = match existing {
        Some(member) => {
            sqlx::query("UPDATE members SET is_superuser = TRUE, is_staff = TRUE, is_iao = TRUE, password_hash = COALESCE($2, password_hash) WHERE id = $1")
                .bind(member.id)
                .bind(&password_hash)
                .execute(&mut *tx)
                .await
                .map_err(db::errors::DbError::from)?;
            member.id
        }
        None => {
            let (first_name, last_name) = ("Admin".to_string(), "ikwen".to_string());
            let created = Members::new(&mut tx)
                .create(&MemberCreateDBRequest {
                    username: email.clone(),
                    email: Some(email.clone()),
                    full_name: compose_full_name(&first_name, &last_name),
                    first_name,
                    last_name,
                    password_hash,
                    is_iao: true,
                    is_staff: true,
                    is_superuser: true,
                    ..Default::default()
                })
                .await?;
            info!(member_id = %created.id, "Created superuser");
            created.id
        }
    };

    if let Some(service_id) = home_service {
        let mut groups = Groups::new(&mut tx);
        match groups.get_by_name(service_id, SUDO_GROUP).await? {
            Some(sudo) => {
                groups.add_member(sudo.id, member_id).await?;
            }
            None => warn!(service_id = %service_id, "Default service not found, superuser left out of Sudo"),
        }
    }

    tx.commit().await.map_err(db::errors::DbError::from)?;
    Ok(member_id)
}

/// Register the databases services were created with, so their pools exist before traffic arrives.
pub async fn register_tenant_databases(db: &DbRouter) -> Result<usize, Error> {
    let mut conn = db.acquire().await.map_err(db::errors::DbError::from)?;
    let names = Services::new(&mut conn).database_names().await?;

    let mut added = 0;
    for name in names.iter().filter(|name| !db.contains(name)) {
        match db.add_database(name) {
            Ok(()) => added += 1,
            Err(e) => warn!(database = %name, "Skipping tenant database: {}", e),
        }
    }
    Ok(added)
}

/// Connect the databases and bring their schema up to date.
async fn setup_database(config: &Config, pool: Option<PgPool>) -> anyhow::Result<DbRouter> {
    let db = match pool {
        Some(pool) => DbRouter::new(pool),
        None => DbRouter::connect(&config.database).await?,
    };

    migrator().run(db.default_pool()).await?;
    for alias in config.database.aliases.keys() {
        info!(alias = %alias, "Running migrations");
        migrator().run(&db.using(alias)).await?;
    }

    create_superuser(
        &config.admin_email,
        config.admin_password.as_deref(),
        config.default_service_id,
        db.default_pool(),
    ).await?;
    let added = register_tenant_databases(&db).await?;
    debug!(added, "Tenant databases registered");

    Ok(db)
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.auth.security.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::PATCH,
            http::Method::DELETE,
        ])
        .allow_headers([
            http::header::CONTENT_TYPE,
            http::header::AUTHORIZATION,
            http::HeaderName::from_static(auth::current_user::SERVICE_HEADER),
        ])
        .allow_credentials(config.auth.security.cors.allow_credentials)
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.auth.security.cors.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Routes of the platform API, mounted under `/api/v1`.
fn api_routes() -> Router<AppState> {
    Router::new()
        // Core
        .route("/services", get(services::list_services).post(services::create_service))
        .route(
            "/services/{service_id}",
            get(services::get_service).patch(services::update_service).delete(services::delete_service),
        )
        .route("/services/{service_id}/join", post(services::join_service))
        .route("/config", get(config_handlers::get_config).patch(config_handlers::update_config))
        .route(
            "/invoicing-config",
            get(config_handlers::get_invoicing_config).patch(config_handlers::update_invoicing_config),
        )
        .route("/events", get(events::list_events))
        .route("/sending-reports", get(events::list_sending_reports))
        // Access control
        .route("/members", get(members::list_members))
        .route("/members/me", get(members::get_current_member).patch(members::update_current_member))
        .route("/members/{member_id}", get(members::get_member))
        .route("/members/{member_id}/toggle", post(members::toggle_member))
        .route("/members/{member_id}/group", put(members::move_member_to_group))
        .route(
            "/members/{member_id}/permissions",
            get(members::get_member_permissions).put(members::set_member_permissions),
        )
        .route(
            "/members/{member_id}/profile-tags",
            get(members::get_member_profile_tags).put(members::set_member_profile_tags),
        )
        .route("/groups", get(groups::list_groups).post(groups::create_group))
        .route(
            "/groups/{group_id}",
            get(groups::get_group).patch(groups::update_group).delete(groups::delete_group),
        )
        .route(
            "/groups/{group_id}/permissions",
            get(groups::get_group_permissions).put(groups::set_group_permissions),
        )
        // Billing
        .route("/products", get(products::list_products).post(products::create_product))
        .route(
            "/products/{id}",
            get(products::get_product).patch(products::update_product).delete(products::delete_product),
        )
        .route(
            "/subscriptions",
            get(subscriptions::list_subscriptions).post(subscriptions::create_subscription),
        )
        .route("/subscriptions/{id}", get(subscriptions::get_subscription))
        .route("/subscriptions/{id}/billing-cycle", put(subscriptions::change_billing_cycle))
        .route("/subscriptions/{id}/status", put(subscriptions::change_subscription_status))
        .route("/invoices", get(invoices::list_invoices).post(invoices::create_invoice))
        .route("/invoices/{id}", get(invoices::get_invoice))
        .route(
            "/invoices/{id}/payments",
            get(invoices::list_invoice_payments).post(invoices::record_payment),
        )
        .route("/invoices/{id}/wallet-payment", post(invoices::pay_with_wallet_balance))
        .route(
            "/payment-means",
            get(payment_means::list_payment_means).post(payment_means::create_payment_mean),
        )
        .route("/payment-means/{id}/toggle", post(payment_means::toggle_payment_mean))
        .route("/payment-means/{id}/credentials", put(payment_means::set_payment_mean_credentials))
        .route("/payments/mobile-money", post(mobile_money_handlers::start_mobile_money_payment))
        .route("/payments/mobile-money/{id}", get(mobile_money_handlers::get_mobile_money_transaction))
        // Revival
        .route(
            "/profile-tags",
            get(profile_tags::list_profile_tags).post(profile_tags::create_profile_tag),
        )
        .route("/profile-tags/objects", put(profile_tags::set_object_tags))
        .route(
            "/profile-tags/{id}",
            axum::routing::patch(profile_tags::update_profile_tag).delete(profile_tags::delete_profile_tag),
        )
        .route("/revivals", get(revivals::list_revivals).post(revivals::create_revival))
        .route(
            "/revivals/{id}",
            get(revivals::get_revival).patch(revivals::update_revival).delete(revivals::delete_revival),
        )
        .route(
            "/cyclic-revivals",
            get(cyclic_revivals::list_cyclic_revivals).post(cyclic_revivals::create_cyclic_revival),
        )
        .route(
            "/cyclic-revivals/{id}",
            get(cyclic_revivals::get_cyclic_revival)
                .patch(cyclic_revivals::update_cyclic_revival)
                .delete(cyclic_revivals::delete_cyclic_revival),
        )
}

/// Build the application router with every endpoint and middleware.
///
/// - `/authentication/*`: registration, login and password recovery
/// - `/api/v1/*`: the tenant-scoped platform API
/// - `/webhooks/mobile-money/*`: signed operator notifications
/// - `/docs`: API reference
/// - `/internal/metrics`: Prometheus metrics, when enabled
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let auth_routes = Router::new()
        .route(
            "/authentication/register",
            get(auth_handlers::get_registration_info).post(auth_handlers::register),
        )
        .route("/authentication/login", post(auth_handlers::login))
        .route("/authentication/logout", post(auth_handlers::logout))
        .route("/authentication/password-resets", post(auth_handlers::request_password_reset))
        .route(
            "/authentication/password-resets/{token_id}/confirm",
            post(auth_handlers::confirm_password_reset),
        )
        .route("/authentication/password-change", post(auth_handlers::change_password));

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .merge(auth_routes)
        .nest("/api/v1", api_routes())
        .route(
            "/webhooks/mobile-money/{provider}/{transaction_id}",
            post(mobile_money_handlers::mobile_money_notification),
        )
        .with_state(state.clone())
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if state.config.enable_metrics {
        let (prometheus_layer, handle) = PrometheusMetricLayer::pair();
        router = router
            .route(
                "/internal/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            )
            .layer(prometheus_layer);
    }

    router = router.layer(create_cors_layer(&state.config)?);

    if state.config.enable_request_logging {
        router = router.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        );
    }

    Ok(router)
}

/// Next time the daily jobs should run: today at `hour` (UTC) if still ahead, else tomorrow.
fn next_daily_run(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today.checked_add_days(Days::new(1)).unwrap_or(today)
    }
}

async fn run_billing_jobs(invoicing: Invoicing, run_at_hour: u32, shutdown: CancellationToken) {
    loop {
        let now = Utc::now();
        let next = next_daily_run(now, run_at_hour);
        info!(next_run = %next, "Invoicing jobs scheduled");

        let wait = (next - now).to_std().unwrap_or_default();
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match invoicing.run_daily(Utc::now()).await {
            Ok(report) => info!(?report, "Invoicing jobs done"),
            Err(e) => error!("Invoicing jobs failed: {}", e),
        }
    }
    debug!("Invoicing jobs stopped");
}

async fn run_revival_jobs(jobs: RevivalJobs, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let report = jobs.run_all(Utc::now()).await;
        info!(?report, "Revival pass done");
    }
    debug!("Revival jobs stopped");
}

/// Start the jobs only the leader runs. They stop when `session` is cancelled.
fn start_scheduled_jobs(state: &AppState, session: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let jobs = &state.config.background_services;

    let collector = state.collector.clone();
    handles.push(tokio::spawn(async move {
        match collector.resume_running(Utc::now()).await {
            Ok(0) => {}
            Ok(resumed) => info!(resumed, "Resumed running mobile money transactions"),
            Err(e) => error!("Failed to resume mobile money transactions: {}", e),
        }
    }));

    if jobs.billing.enabled {
        match Invoicing::new(state.db.clone(), state.notifier.clone()) {
            Ok(invoicing) => handles.push(tokio::spawn(run_billing_jobs(invoicing, jobs.billing.run_at_hour, session.clone()))),
            Err(e) => error!("Billing jobs not started: {}", e),
        }
    }

    if jobs.revival.enabled {
        let revivals = RevivalJobs::new(state.db.clone(), state.notifier.clone());
        handles.push(tokio::spawn(run_revival_jobs(revivals, jobs.revival.interval, session.clone())));
    }

    info!(count = handles.len(), "Scheduled jobs started");
    handles
}

/// Background tasks running alongside the HTTP server.
///
/// Dropping the struct cancels the shutdown token through `drop_guard`, which stops every task.
pub struct BackgroundServices {
    is_leader: Arc<AtomicBool>,
    background_tasks: Vec<JoinHandle<()>>,
    notifier_tasks: TaskTracker,
    collector_tasks: TaskTracker,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Stop every task, then wait for pending notifications and pollers.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }

        self.notifier_tasks.close();
        self.collector_tasks.close();
        self.notifier_tasks.wait().await;
        self.collector_tasks.wait().await;
    }
}

/// Start the pool sampler and the scheduled jobs, behind leader election when it is enabled.
async fn setup_background_services(state: AppState, shutdown_token: CancellationToken) -> anyhow::Result<BackgroundServices> {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    let pools = state.db.labeled_pools();
    let sampler_shutdown = shutdown_token.clone();
    background_tasks.push(tokio::spawn(async move {
        if let Err(e) = run_pool_metrics_sampler(pools, PoolMetricsConfig::default(), sampler_shutdown).await {
            error!("Pool metrics sampler error: {}", e);
        }
    }));

    let is_leader = Arc::new(AtomicBool::new(false));

    if state.config.background_services.leader_election.enabled {
        // Jobs of the current leadership session, cancelled when leadership is lost
        let session: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

        let handle = tokio::spawn({
            let pool = state.db.default_pool().clone();
            let is_leader = is_leader.clone();
            let shutdown = shutdown_token.clone();
            let gain_session = session.clone();
            let lose_session = session;
            let state = state.clone();
            async move {
                leader_election::leader_election_task(
                    pool,
                    is_leader,
                    LEADER_LOCK_ID,
                    LEADER_CHECK_INTERVAL,
                    shutdown.clone(),
                    move || {
                        let session = gain_session.clone();
                        let state = state.clone();
                        let token = shutdown.child_token();
                        async move {
                            if let Some(previous) = session.lock().await.replace(token.clone()) {
                                previous.cancel();
                            }
                            start_scheduled_jobs(&state, token);
                            Ok(())
                        }
                    },
                    move || {
                        let session = lose_session.clone();
                        async move {
                            if let Some(token) = session.lock().await.take() {
                                token.cancel();
                                info!("Scheduled jobs stopped (lost leadership)");
                            }
                            Ok(())
                        }
                    },
                )
                .await;
            }
        });
        background_tasks.push(handle);
    } else {
        info!("Leader election disabled, running scheduled jobs on this replica");
        is_leader.store(true, std::sync::atomic::Ordering::Relaxed);
        background_tasks.extend(start_scheduled_jobs(&state, shutdown_token.clone()));
    }

    Ok(BackgroundServices {
        is_leader,
        background_tasks,
        notifier_tasks: state.notifier.tasks().clone(),
        collector_tasks: state.collector.tasks().clone(),
        shutdown_token,
        drop_guard: Some(drop_guard),
    })
}

/// Top-level container owning the router, the databases and the background services.
///
/// 1. [`Application::new`] connects the databases, runs migrations, bootstraps the superuser and
///    starts the background services.
/// 2. [`Application::serve`] serves HTTP until the shutdown future resolves, then stops the
///    background services and closes every pool.
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Create the application on an existing pool instead of connecting `config.database`.
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("Starting ikwen with configuration: {:#?}", config);

        let db = setup_database(&config, pool).await?;
        // Surface a dead default database now rather than on the first request
        db.default_pool().execute("SELECT 1").await?;

        let shutdown_token = CancellationToken::new();
        let app_state = AppState::new(db, config.clone(), shutdown_token.clone())?;
        let bg_services = setup_background_services(app_state.clone(), shutdown_token).await?;
        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            app_state,
            config,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("ikwen listening on http://{}, public URL {}", bind_addr, self.config.public_url);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.app_state.db.close().await;

        Ok(())
    }
}
