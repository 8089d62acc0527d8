//! Upcoming-appointments view (Askama) and its Axum HTTP surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Datelike, Duration, Local, NaiveDate, NaiveTime};
use churchcal_core::{format_day_date, german_weekday, week_windows, Event};
use churchcal_storage::EventStore;
use churchcal_sync::{ImportPipeline, SyncConfig};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "churchcal-web";

#[derive(Clone)]
pub struct AppState {
    pub store: EventStore,
    pub weeks: usize,
    /// Fixed "today"; the local date is used when unset.
    pub today: Option<NaiveDate>,
}

impl AppState {
    pub fn new(store: EventStore, weeks: usize) -> Self {
        Self {
            store,
            weeks,
            today: None,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }
}

/// Events of one calendar day, in display order.
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup {
    pub date: NaiveDate,
    pub events: Vec<Event>,
}

/// Group events by start date. Days ascend; within a day events are ordered by
/// start time, then title.
pub fn group_daily(events: Vec<Event>) -> Vec<DayGroup> {
    let mut by_day = BTreeMap::<NaiveDate, Vec<Event>>::new();
    for event in events {
        by_day.entry(event.start.date()).or_default().push(event);
    }
    by_day
        .into_iter()
        .map(|(date, mut events)| {
            events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));
            DayGroup { date, events }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct EntryView {
    pub id: i64,
    pub time: String,
    pub title: String,
    pub has_link: bool,
    pub link: String,
    pub has_contact: bool,
    pub contact: String,
}

#[derive(Debug, Clone)]
pub struct DayView {
    pub day_name: String,
    pub day_date: String,
    pub entries: Vec<EntryView>,
}

#[derive(Debug, Clone, Default)]
pub struct WeekView {
    pub days: Vec<DayView>,
}

impl From<DayGroup> for DayView {
    fn from(group: DayGroup) -> Self {
        Self {
            day_name: german_weekday(group.date.weekday()).to_string(),
            day_date: format_day_date(group.date),
            entries: group
                .events
                .into_iter()
                .map(|event| EntryView {
                    id: event.id,
                    time: event.start.format("%H:%M").to_string(),
                    title: event.title,
                    has_link: event.link.is_some(),
                    link: event.link.unwrap_or_default(),
                    has_contact: event.contact.is_some(),
                    contact: event.contact.unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// What the appointments fragment shows.
#[derive(Debug, Clone)]
pub enum Appointments {
    /// The event table has not been created (never activated, or deactivated).
    Unavailable,
    Weeks(Vec<WeekView>),
}

/// One query per week window, grouped for display.
pub async fn load_appointments(
    store: &EventStore,
    today: NaiveDate,
    weeks: usize,
) -> anyhow::Result<Appointments> {
    if !store.table_exists().await? {
        return Ok(Appointments::Unavailable);
    }

    let mut out = Vec::with_capacity(weeks);
    for window in week_windows(today, weeks) {
        let events = store.query_range(window.from, window.to).await?;
        out.push(WeekView {
            days: group_daily(events).into_iter().map(DayView::from).collect(),
        });
    }
    Ok(Appointments::Weeks(out))
}

#[derive(Template)]
#[template(path = "appointments.html")]
struct AppointmentsTemplate {
    available: bool,
    weeks: Vec<WeekView>,
}

#[derive(Template)]
#[template(path = "page.html")]
struct PageTemplate {
    available: bool,
    weeks: Vec<WeekView>,
}

fn template_parts(appointments: Appointments) -> (bool, Vec<WeekView>) {
    match appointments {
        Appointments::Unavailable => (false, Vec::new()),
        Appointments::Weeks(weeks) => (true, weeks),
    }
}

/// The appointment list as an HTML fragment.
pub fn render_appointments(appointments: Appointments) -> askama::Result<String> {
    let (available, weeks) = template_parts(appointments);
    AppointmentsTemplate { available, weeks }.render()
}

/// The full "All Appointments" page.
pub fn render_page(appointments: Appointments) -> askama::Result<String> {
    let (available, weeks) = template_parts(appointments);
    PageTemplate { available, weeks }.render()
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(page_handler))
        .route("/appointments", get(fragment_handler))
        .route("/api/events", get(events_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(Arc::new(state))
}

/// Serve the web UI, running the import schedule alongside when it is enabled.
pub async fn serve_from_env(port: Option<u16>) -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let port = port
        .or_else(|| {
            std::env::var("CHURCHCAL_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(8000);
    let store = config.open_store().await?;
    let state = AppState::new(store.clone(), config.weeks);

    // The remote source is only needed when this process also imports.
    let scheduler = if config.scheduler_enabled {
        let source = config.churchtools_source()?;
        let pipeline = Arc::new(ImportPipeline::new(config, store, Box::new(source)));
        pipeline.maybe_build_scheduler().await?
    } else {
        None
    };
    if let Some(sched) = &scheduler {
        sched.start().await?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving appointments");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

async fn page_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_appointments(&state.store, state.today(), state.weeks).await {
        Ok(appointments) => render_html(render_page(appointments)),
        Err(err) => server_error(err),
    }
}

async fn fragment_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_appointments(&state.store, state.today(), state.weeks).await {
        Ok(appointments) => render_html(render_appointments(appointments)),
        Err(err) => server_error(err),
    }
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let from = query.from.unwrap_or_else(|| state.today());
    let Some(to) = query
        .to
        .or_else(|| from.checked_add_signed(Duration::weeks(1)))
    else {
        return (StatusCode::BAD_REQUEST, "`from` is out of range").into_response();
    };
    if to <= from {
        return (StatusCode::BAD_REQUEST, "`to` must be after `from`").into_response();
    }

    match state
        .store
        .query_range(from.and_time(NaiveTime::MIN), to.and_time(NaiveTime::MIN))
        .await
    {
        Ok(events) => Json(events).into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn render_html(rendered: askama::Result<String>) -> Response {
    match rendered {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::NaiveDateTime;
    use churchcal_core::EventDraft;
    use churchcal_storage::{connect_in_memory, TableName};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    // A Wednesday.
    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 21).unwrap()
    }

    fn dt(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn draft(title: &str, start: &str) -> EventDraft {
        EventDraft {
            title: title.to_string(),
            start: dt(start),
            end: dt(start) + Duration::hours(1),
            contact: None,
            link: None,
        }
    }

    fn event(id: i64, title: &str, start: &str) -> Event {
        Event {
            id,
            last_changed: 1,
            title: title.to_string(),
            start: dt(start),
            end: dt(start) + Duration::hours(1),
            contact: None,
            link: None,
        }
    }

    async fn seeded_store() -> EventStore {
        let store = EventStore::new(connect_in_memory().await.unwrap(), TableName::default());
        store.create_table().await.unwrap();
        let mut service = draft("Gottesdienst", "2026-10-25 10:00:00");
        service.contact = Some("Anna Muster".into());
        service.link = Some("https://example.org/?a=1&b=2".into());
        store
            .replace_all(
                1,
                &[
                    draft("Gestern", "2026-10-20 19:00:00"),
                    draft("Bibelkreis", "2026-10-22 19:30:00"),
                    service,
                    draft("<b>Chor", "2026-10-25 10:00:00"),
                    draft("Zu spät", "2026-11-02 09:00:00"),
                ],
            )
            .await
            .unwrap();
        store
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn days_ascend_and_same_start_sorts_by_title() {
        let groups = group_daily(vec![
            event(3, "Zebra", "2026-10-25 10:00:00"),
            event(1, "Abend", "2026-10-25 19:00:00"),
            event(2, "Anfang", "2026-10-25 10:00:00"),
            event(4, "Vorher", "2026-10-22 08:00:00"),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].date, NaiveDate::from_ymd_opt(2026, 10, 22).unwrap());
        let titles = groups[1].events.iter().map(|e| e.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Anfang", "Zebra", "Abend"]);
    }

    #[tokio::test]
    async fn appointments_are_split_into_week_windows() {
        let store = seeded_store().await;
        let Appointments::Weeks(weeks) = load_appointments(&store, today(), 2).await.unwrap() else {
            panic!("table exists");
        };
        assert_eq!(weeks.len(), 2);
        let first = &weeks[0].days;
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].day_name, "Donnerstag");
        assert_eq!(first[0].day_date, "22. Oktober");
        assert_eq!(first[1].day_name, "Sonntag");
        assert_eq!(first[1].entries.len(), 2);
        assert!(weeks[1].days.is_empty());
    }

    #[tokio::test]
    async fn fragment_renders_entries_escaped_and_marks_empty_weeks() {
        let store = seeded_store().await;
        let html = render_appointments(load_appointments(&store, today(), 2).await.unwrap()).unwrap();

        assert!(html.starts_with("<div class=\"appointment-list\">"));
        assert!(html.contains("<div class=\"time\">19:30</div>"));
        assert!(html.contains("<div class=\"contact\">Anna Muster</div>"));
        assert!(html.contains("a=1&amp;b=2\">Gottesdienst</a>"));
        assert!(html.contains("&lt;b&gt;Chor"));
        assert!(!html.contains("Gestern"));
        assert!(!html.contains("Zu spät"));
        assert_eq!(html.matches("Keine Termine gefunden").count(), 1);
    }

    #[tokio::test]
    async fn page_handler_wraps_the_list() {
        let app = app(AppState::new(seeded_store().await, 2).with_today(today()));
        let (status, body) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("All Appointments"));
        assert!(body.contains("Gottesdienst"));
        assert!(body.contains("id=\"event-"));
    }

    #[tokio::test]
    async fn missing_table_renders_unavailable_notice() {
        let store = EventStore::new(connect_in_memory().await.unwrap(), TableName::default());
        let app = app(AppState::new(store, 2).with_today(today()));
        let (status, body) = get(app, "/appointments").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("The ChurchTools calendar is not available."));
    }

    #[tokio::test]
    async fn events_api_returns_json_for_range() {
        let app = app(AppState::new(seeded_store().await, 2).with_today(today()));
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/events?from=2026-10-25&to=2026-10-26")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "application/json");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let events: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(events.len(), 2);

        let (status, _) = get(app, "/api/events?from=2026-10-26&to=2026-10-25").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn events_api_rejects_from_at_the_end_of_the_calendar() {
        let app = app(AppState::new(seeded_store().await, 2).with_today(today()));
        let last_day = NaiveDate::MAX.to_string().replace('+', "%2B");
        let (status, _) = get(app, &format!("/api/events?from={last_day}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn healthz_responds() {
        let store = EventStore::new(connect_in_memory().await.unwrap(), TableName::default());
        let (status, body) = get(app(AppState::new(store, 2)), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
