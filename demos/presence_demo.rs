//! Walks a handful of subjects around Soho for a few minutes of simulated
//! time and prints what the engine derives from their pings.
//!
//! Run with `RUST_LOG=info cargo run --example presence_demo`.

use std::sync::Arc;

use presence_engine::config::EngineConfig;
use presence_engine::debounce::MovementClass;
use presence_engine::geo_utils::{bounds_around, offset_point};
use presence_engine::scheduler::run_all;
use presence_engine::{
    BuildBudget, GpsPoint, NearbyFilters, PresenceEngine, PresencePing, RecFilters, StaticFriendGraph, VenueCandidate,
};

fn main() -> presence_engine::Result<()> {
    env_logger::init();

    let friends = Arc::new(StaticFriendGraph::new());
    friends.befriend("alice", "bob");
    friends.befriend("alice", "carol");

    let engine = PresenceEngine::new(EngineConfig::default(), friends)?;
    let soho = GpsPoint::new(51.5136, -0.1365);
    let start = 1_710_525_600; // 2024-03-15T18:00:00Z

    let mut venue_ids = Vec::new();
    for (id, name, north, east) in [("1", "The Blue Posts", 40.0, 10.0), ("2", "Bar Italia", -250.0, 120.0)] {
        let candidate = VenueCandidate {
            provider: "osm".into(),
            provider_id: id.into(),
            name: name.into(),
            address: None,
            location: offset_point(&soho, north, east),
            tags: vec!["bar".into()],
        };
        let resolution = engine.resolve_venue(&candidate, "demo-seed", start)?;
        println!("{:<16} -> {:?}", name, resolution);
        if let Some(venue_id) = resolution.venue_id() {
            venue_ids.push(venue_id.to_string());
        }
    }

    let budget = BuildBudget::unlimited();
    for minute in 0..6 {
        let now = start + minute * 60;
        let drift = minute as f64 * 2.0;
        let pings = [
            ("alice", offset_point(&soho, drift, 0.0), "party"),
            ("bob", offset_point(&soho, drift + 8.0, 4.0), "party"),
            ("carol", offset_point(&soho, 30.0, -12.0), "chill"),
            ("dave", offset_point(&soho, -600.0, 300.0 - drift * 40.0), "chill"),
        ];
        for (subject, location, vibe) in pings {
            let mut ping = PresencePing::new(subject, location, now)
                .with_vibe(vibe)
                .with_movement(MovementClass::Walking);
            if subject == "bob" {
                ping = ping.with_venue(venue_ids[0].clone());
            }
            let outcome = engine.upsert_presence(subject, &ping, now)?;
            log::debug!("{} at +{}m: {:?}", subject, minute, outcome.reason);
        }
        run_all(&engine, now, &budget);
    }

    let now = start + 5 * 60;
    println!("\nNearby alice:");
    for user in engine.nearby_users("alice", soho.latitude, soho.longitude, 500.0, &NearbyFilters::default(), now)? {
        println!("  {:<6} {:>6.1}m  vibe={:?}", user.subject_id, user.distance_m, user.vibe);
    }

    println!("\nVibe clusters:");
    for cluster in engine.vibe_clusters(&bounds_around(&soho, 1_000.0), 12, now)? {
        println!("  {} members={} dominant={:?}", cluster.cell_key, cluster.total_members, cluster.dominant_vibe);
    }

    println!("\nCrossed paths for alice today:");
    for path in engine.crossed_paths_today("alice", now) {
        println!("  {} sightings={} closest={:.1}m", path.pair, path.sightings, path.closest_distance_m);
    }

    println!("\nRecommendations for alice:");
    let recs = RecFilters { vibe: Some("party".into()), tags: Vec::new(), radius_m: Some(1_000.0) };
    for rec in engine.personalized_recs("alice", soho.latitude, soho.longitude, &recs, now)? {
        println!("  {:<16} score={:.3} {:?}", rec.name, rec.score, rec.breakdown);
    }

    Ok(())
}
