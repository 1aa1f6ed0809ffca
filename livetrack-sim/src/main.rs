mod walker;

use std::{borrow::Cow, sync::Arc};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use livetrack_logic::{
    Backoff, ConnectionState, Coordinate, DistanceResult, LocationSample, OrderRestaurant,
    ParticipantRole, PeerPresence, PollingLocationSource, RestaurantLocation, ServerEndpoint,
    StateUpdateSender, StaticToken, TrackerPhase, TrackerRegistry, TrackerSnapshot,
    TrackingChannel, TrackingSettings, prelude::*,
};
use livetrack_transport::{
    HttpOrderLookup, HttpProfileDirectory, SERVER_HTTP_URL, WsConnector, default_endpoint,
    register_order_restaurant, register_profile,
};
use log::{debug, info, warn};
use specta::TypeCollection;
use specta_typescript::Typescript;
use tokio::sync::mpsc;

use walker::{WalkingProvider, parse_coordinate};

#[derive(Parser)]
struct Cli {
    /// Websocket base URL of the tracking server, defaults to the one this build was made for
    #[arg(long)]
    server: Option<String>,

    /// HTTP base URL of the tracking server
    #[arg(long, default_value = SERVER_HTTP_URL)]
    http: String,

    /// Bearer token sent on every request
    #[arg(long, default_value = "dev-token")]
    token: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a simulated walk for an order as the customer
    Share {
        order_id: String,
        participant_id: String,
        /// Where the walk starts, as LAT,LNG
        #[arg(long, value_parser = parse_coordinate)]
        from: Coordinate,
        /// Where the walk ends, as LAT,LNG
        #[arg(long, value_parser = parse_coordinate)]
        to: Coordinate,
        /// Number of fixes to reach the destination
        #[arg(long, default_value_t = 30)]
        steps: u32,
        /// Reported accuracy of each fix in meters
        #[arg(long, default_value_t = 10.0)]
        accuracy: f64,
        /// Milliseconds between fixes
        #[arg(long, default_value_t = 2000)]
        interval_ms: u32,
        #[arg(long)]
        name: Option<String>,
    },
    /// Follow an order as the restaurant
    Watch {
        order_id: String,
        participant_id: String,
    },
    /// Show every customer sharing with a restaurant
    Dashboard { restaurant_id: String },
    /// Register the restaurant serving an order on the server
    Register {
        order_id: String,
        restaurant_id: String,
        /// Restaurant position as LAT,LNG
        #[arg(long, value_parser = parse_coordinate)]
        at: Coordinate,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        address: Option<String>,
    },
    /// Register a display name for a participant
    Profile {
        participant_id: String,
        display_name: String,
    },
    /// Export the UI facing types as TypeScript
    ExportTypes { path: String },
}

#[derive(Clone)]
struct UpdateSender(mpsc::UnboundedSender<()>);

impl StateUpdateSender for UpdateSender {
    fn send_update(&self) {
        if self.0.send(()).is_err() {
            debug!("Update receiver gone, dropping update");
        }
    }
}

type Registry = TrackerRegistry<WsConnector, PollingLocationSource<WalkingProvider>, UpdateSender>;

struct Session {
    registry: Registry,
    updates: mpsc::UnboundedReceiver<()>,
}

impl Session {
    fn new(cli: &Cli, settings: TrackingSettings) -> Result<Self> {
        let endpoint = cli
            .server
            .as_ref()
            .map(|base| ServerEndpoint::new(base.clone(), default_endpoint().path))
            .unwrap_or_else(default_endpoint);
        info!("Using tracking endpoint {}", endpoint.socket_url());

        let channel = Arc::new(
            TrackingChannel::new(WsConnector, endpoint, StaticToken(cli.token.clone()))
                .with_retry(Backoff::default()),
        );
        let token = Arc::new(StaticToken(cli.token.clone()));
        let orders = HttpOrderLookup::new(cli.http.clone(), token.clone())?;
        let profiles = HttpProfileDirectory::new(cli.http.clone(), token)?;

        let (tx, updates) = mpsc::unbounded_channel();
        let registry = TrackerRegistry::new(channel, settings, UpdateSender(tx))
            .with_order_lookup(Arc::new(orders))
            .with_profiles(Arc::new(profiles));

        Ok(Self { registry, updates })
    }

    /// Wait for the next state update, `false` once the user asked to quit
    async fn next_update(&mut self) -> bool {
        tokio::select! {
            biased;

            Ok(_) = tokio::signal::ctrl_c() => false,
            update = self.updates.recv() => update.is_some(),
        }
    }
}

fn describe(snapshot: &TrackerSnapshot) -> String {
    let distance = snapshot
        .distance
        .as_ref()
        .map(|d| d.formatted.as_str())
        .unwrap_or("--");
    let peer = snapshot
        .peer_location
        .as_ref()
        .map(|s| format!("{:.5},{:.5}", s.lat, s.lng))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "{:?} connected={} sharing={} peer_sharing={} peer={peer} distance={distance}",
        snapshot.phase, snapshot.is_connected, snapshot.is_sharing, snapshot.peer_sharing
    )
}

async fn run_share(
    mut session: Session,
    order_id: String,
    participant_id: String,
    walker: WalkingProvider,
    name: Option<String>,
) -> Result {
    let tracker = session
        .registry
        .open(
            order_id.clone(),
            participant_id,
            ParticipantRole::Sharer,
            name,
            PollingLocationSource::new(walker),
        )
        .await;

    let mut requested = false;
    while session.next_update().await {
        let snapshot = tracker.snapshot().await;
        println!("{}", describe(&snapshot));

        match snapshot.phase {
            TrackerPhase::Connected if !requested => {
                info!("Connected to order {order_id}, starting to share");
                requested = true;
                tracker.start_sharing_location().await;
            }
            TrackerPhase::Connected => {
                if let Some(why) = snapshot.last_error.as_ref() {
                    warn!("{why}");
                }
            }
            TrackerPhase::Connecting | TrackerPhase::Idle => {
                // Losing the connection drops sharing, ask again once the room is back
                requested = false;
            }
            TrackerPhase::Sharing => {}
            TrackerPhase::Closed => break,
        }
    }

    session.registry.close_all().await;
    Ok(())
}

async fn run_watch(mut session: Session, order_id: String, participant_id: String) -> Result {
    // Watchers never poll, the provider only satisfies the tracker's source type
    let idle = Coordinate { lat: 0.0, lng: 0.0 };
    let tracker = session
        .registry
        .open(
            order_id,
            participant_id,
            ParticipantRole::Watcher,
            None,
            PollingLocationSource::new(WalkingProvider::new(idle, idle, 1, 0.0)),
        )
        .await;

    while session.next_update().await {
        let snapshot = tracker.snapshot().await;
        println!("{}", describe(&snapshot));
        if snapshot.phase == TrackerPhase::Closed {
            break;
        }
    }

    session.registry.close_all().await;
    Ok(())
}

fn describe_sharer(presence: &PeerPresence) -> String {
    let at = presence
        .last_sample
        .as_ref()
        .map(|s| format!("{:.5},{:.5}", s.lat, s.lng))
        .unwrap_or_else(|| "waiting for a fix".to_string());
    let distance = presence
        .distance
        .as_ref()
        .map(|d| d.formatted.as_str())
        .unwrap_or("--");
    format!(
        "  {} ({}) for order {} at {at}, {distance} away",
        presence.display_name, presence.participant_id, presence.order_id
    )
}

async fn run_dashboard(mut session: Session, restaurant_id: String) -> Result {
    let aggregator = session.registry.aggregator(restaurant_id.clone()).await;

    while session.next_update().await {
        let mut sharers = aggregator.active_sharers().await.into_values().collect::<Vec<_>>();
        sharers.sort_by(|a, b| a.order_id.cmp(&b.order_id));

        let connection = aggregator.connection_state().await;
        println!(
            "{restaurant_id}: {} sharing ({connection:?})",
            sharers.len()
        );
        for presence in sharers.iter() {
            println!("{}", describe_sharer(presence));
        }
    }

    session.registry.close_all().await;
    Ok(())
}

fn export_types(path: &str) -> Result {
    let mut types = TypeCollection::default();
    types
        .register::<TrackerSnapshot>()
        .register::<TrackerPhase>()
        .register::<PeerPresence>()
        .register::<ConnectionState>()
        .register::<TrackingSettings>()
        .register::<RestaurantLocation>()
        .register::<LocationSample>()
        .register::<DistanceResult>()
        .register::<ParticipantRole>();

    let mut lang = Typescript::new();
    lang.header = Cow::Borrowed(
        "/* eslint @typescript-eslint/no-unused-vars: 0 */\n/* eslint @typescript-eslint/no-explicit-any: 0 */",
    );
    lang.export_to(path, &types)
        .map_err(|why| anyhow!("Failed to export types: {why:?}"))?;
    println!("Successfully exported types to {path}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result {
    colog::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Share {
            order_id,
            participant_id,
            from,
            to,
            steps,
            accuracy,
            interval_ms,
            name,
        } => {
            let settings = TrackingSettings {
                min_interval_ms: *interval_ms,
                ..Default::default()
            };
            let session = Session::new(&cli, settings)?;
            let walker = WalkingProvider::new(*from, *to, *steps, *accuracy);
            run_share(
                session,
                order_id.clone(),
                participant_id.clone(),
                walker,
                name.clone(),
            )
            .await
        }
        Commands::Watch {
            order_id,
            participant_id,
        } => {
            let session = Session::new(&cli, TrackingSettings::default())?;
            run_watch(session, order_id.clone(), participant_id.clone()).await
        }
        Commands::Dashboard { restaurant_id } => {
            let session = Session::new(&cli, TrackingSettings::default())?;
            run_dashboard(session, restaurant_id.clone()).await
        }
        Commands::Register {
            order_id,
            restaurant_id,
            at,
            name,
            address,
        } => {
            let body = OrderRestaurant {
                restaurant_id: restaurant_id.clone(),
                lat: at.lat,
                lon: at.lng,
                name: name.clone(),
                address: address.clone(),
            };
            register_order_restaurant(&cli.http, order_id, &body, &StaticToken(cli.token.clone()))
                .await
                .context("Failed to register restaurant")?;
            println!("Order {order_id} is now served by {restaurant_id}");
            Ok(())
        }
        Commands::Profile {
            participant_id,
            display_name,
        } => {
            register_profile(
                &cli.http,
                participant_id,
                display_name,
                &StaticToken(cli.token.clone()),
            )
            .await
            .context("Failed to register profile")?;
            println!("{participant_id} is now shown as {display_name}");
            Ok(())
        }
        Commands::ExportTypes { path } => export_types(path),
    }
}
