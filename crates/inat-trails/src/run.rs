//! The end-to-end pipeline from GPX files to the waypoint report

use crate::report::{self, PlaceNames};
use crate::settings::Settings;
use anyhow::Context;
use chrono::Datelike;
use inat_trails_lib::api::HttpTransport;
use inat_trails_lib::utils::month_window;
use inat_trails_lib::{
    CacheConfig, Config, DiskCache, ObservationQuery, PlaceRecord, Retriever, Track, TrailIndex,
    collect_observations, establishment_status, guess_place_name, places_along,
};
use std::sync::Arc;

fn config_from(settings: &Settings) -> Config {
    let mut config = Config::default();
    config.api.request_timeout = settings.request_timeout();
    if let Some(dir) = &settings.cache_dir {
        config.cache = CacheConfig::in_directory(dir);
    }
    config
}

fn query_from(settings: &Settings, track: &Track) -> ObservationQuery {
    let mut query = ObservationQuery::new(track.bbox());
    if let Some(taxon) = settings.iconic_taxon() {
        query = query.with_iconic_taxon(taxon);
    }
    if let Some(grade) = settings.quality_grade.quality_grade() {
        query = query.with_quality_grade(grade);
    }
    if settings.month {
        query = query.with_months(month_window(chrono::Local::now().month()));
    }
    query
}

/// Resolve the place ids statuses refer to, nearby places first
async fn resolve_place_names(
    retriever: &Retriever,
    nearby: &[PlaceRecord],
    ids: Vec<u64>,
) -> anyhow::Result<PlaceNames> {
    let mut names: PlaceNames = nearby
        .iter()
        .map(|place| (place.id, place.label().to_string()))
        .collect();

    let mut missing: Vec<u64> = ids.into_iter().filter(|id| !names.contains_key(id)).collect();
    missing.sort_unstable();
    missing.dedup();
    if !missing.is_empty() {
        let places = retriever
            .fetch_places_by_ids(&missing)
            .await
            .context("Failed to look up places")?;
        names.extend(places.iter().map(|place| (place.id, place.label().to_string())));
    }
    Ok(names)
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let config = config_from(&settings);

    let track = Track::from_gpx_files(&settings.gpx_files).context("Failed to read GPX files")?;
    let corridor = track.corridor(config.trails.buffer_distance);

    let cache = Arc::new(DiskCache::open(&config.cache).with_context(|| {
        format!("Failed to open cache in {}", config.cache.directory.display())
    })?);
    if !settings.no_sweep {
        let sweeper = Arc::clone(&cache);
        // A failed sweep only leaves stale files behind
        match tokio::task::spawn_blocking(move || sweeper.sweep_expired()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Cache sweep failed: {}", e),
            Err(e) => tracing::warn!("Cache sweep task failed: {}", e),
        }
    }

    let transport = Arc::new(HttpTransport::new(&config.api).context("Failed to set up HTTP client")?);
    let retriever = Retriever::new(cache, transport, &config.api);

    let trails = TrailIndex::load(
        &retriever,
        &track.bbox(),
        &corridor,
        config.trails.buffer_distance,
    )
    .await
    .context("Failed to load trails")?;

    let raw = retriever
        .fetch_observations(&query_from(&settings, &track))
        .await
        .context("Failed to download observations")?;
    let mut set = collect_observations(raw, &corridor, &trails, config.trails.accuracy_limit);

    let taxa = retriever
        .fetch_taxa_by_ids(&set.taxon_ids())
        .await
        .context("Failed to download taxa")?;
    set.attach_taxa(&taxa);

    let nearby = retriever
        .fetch_places_nearby(&track.bbox())
        .await
        .context("Failed to download nearby places")?;
    let places = places_along(nearby, &corridor);
    for taxon in &mut set.taxa {
        taxon.status = establishment_status(&taxon.record, &places);
    }

    let status_places = set
        .taxa
        .iter()
        .filter_map(|taxon| taxon.status.as_ref().map(|status| status.place_id))
        .collect();
    let place_names = resolve_place_names(&retriever, &places, status_places).await?;
    let place = guess_place_name(&places, &corridor);

    let output = settings.output_path();
    let written = report::write_waypoints(&output, &set, &place_names, settings.login_names)?;
    report::log_summary(&place, &track, &set, &place_names);
    tracing::info!("Wrote {} waypoints to {}", written, output.display());
    Ok(())
}
