// SPDX-License-Identifier: MIT
// jobsys: frame-loop driver for the category job scheduler
//
// - Queues logging, I/O and render-prep jobs every frame.
// - Main-thread jobs wait for the render prep and run in begin_frame.
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use log::{debug, info, warn};

use jobsys::{Category, DrainPolicy, JobHandle, JobState, Scheduler, SchedulerConfig};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Scheduler configuration (JSON). Flags below override its values.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of background worker threads
    #[arg(long)]
    workers: Option<usize>,

    /// Number of categories; the last well-known one (4) is the main category
    #[arg(long)]
    categories: Option<usize>,

    /// Frames to simulate
    #[arg(long, default_value_t = 10)]
    frames: u32,

    /// Background jobs queued per frame and category
    #[arg(long, default_value_t = 8)]
    jobs_per_frame: usize,

    /// Time box for draining the main category (implies --drain budgeted)
    #[arg(long, value_name = "MS")]
    frame_budget_ms: Option<u64>,

    /// How begin_frame drains the main category
    #[arg(long, value_enum)]
    drain: Option<DrainPolicy>,
}

fn validate_args(args: &Args) -> Result<(), String> {
    if let Some(categories) = args.categories {
        if categories == 0 || categories > Category::MAX_COUNT {
            return Err(format!(
                "--categories must be between 1 and {}",
                Category::MAX_COUNT
            ));
        }
    }

    if let (Some(DrainPolicy::All), Some(_)) = (args.drain, args.frame_budget_ms) {
        return Err("--frame-budget-ms cannot be combined with --drain all".into());
    }

    if args.workers == Some(0) {
        return Err("--workers must be at least 1, background jobs would never run".into());
    }

    if args.frames == 0 {
        return Err("--frames must be at least 1".into());
    }

    Ok(())
}

fn build_config(args: &Args) -> anyhow::Result<SchedulerConfig> {
    let mut config = match &args.config {
        Some(path) => SchedulerConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::default(),
    };

    if let Some(workers) = args.workers {
        config = config.with_workers(workers);
    }
    if let Some(categories) = args.categories {
        let main = (categories > Category::MAIN.index()).then_some(Category::MAIN);
        config = config.with_categories(categories, main);
    }
    if let Some(ms) = args.frame_budget_ms {
        config = config.with_frame_budget(Duration::from_millis(ms));
    }
    if let Some(drain) = args.drain {
        config.drain = drain;
    }

    config.validate()?;
    // every lane the frame loop feeds needs at least one worker
    let background = config.background_categories().len();
    if config.worker_count < background {
        warn!(
            "raising worker count from {} to {background}, one per background category",
            config.worker_count
        );
        config.worker_count = background;
    }
    Ok(config)
}

/// Well-known categories fall back to the generic one when the scheduler
/// was configured with fewer lanes.
fn lane(config: &SchedulerConfig, category: Category) -> Category {
    if category.index() < config.category_count {
        category
    } else {
        Category::GENERIC
    }
}

#[derive(Debug, Default)]
struct FrameCounters {
    logged: AtomicUsize,
    loaded: AtomicUsize,
    prepared: AtomicUsize,
    presented: AtomicUsize,
}

fn queue_frame(
    scheduler: &Scheduler,
    frame: u32,
    jobs_per_frame: usize,
    counters: &Arc<FrameCounters>,
) -> anyhow::Result<Vec<JobHandle>> {
    let config = scheduler.config();
    let main = config.main_category.unwrap_or(Category::GENERIC);
    let mut pending = Vec::with_capacity(jobs_per_frame * 2);

    for i in 0..jobs_per_frame {
        let c = counters.clone();
        let log_job = scheduler.run(
            lane(config, Category::LOGGING),
            move |line: &mut String| {
                debug!("{line}");
                c.logged.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            format!("frame {frame}: log line {i}"),
        )?;
        scheduler.release(log_job)?;

        let c = counters.clone();
        let load = scheduler.run(
            lane(config, Category::IO),
            move |bytes: &mut Vec<u8>| {
                bytes.extend((0..64u8).map(|b| b.wrapping_mul(i as u8)));
                c.loaded.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            Vec::new(),
        )?;

        let c = counters.clone();
        let prepare = scheduler
            .job(
                lane(config, Category::RENDER),
                move |checksum: &mut u64| {
                    *checksum = (i as u64).wrapping_mul(31) ^ u64::from(frame);
                    c.prepared.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                0u64,
            )
            .after(&load)
            .desc(format!("frame {frame}: render prep {i}"))
            .submit()?;
        scheduler.release(load)?;

        let c = counters.clone();
        let present = scheduler
            .job(
                main,
                move |_: &mut ()| {
                    c.presented.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
                (),
            )
            .after(&prepare)
            .desc(format!("frame {frame}: present {i}"))
            .submit()?;

        pending.push(prepare);
        pending.push(present);
    }
    Ok(pending)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = validate_args(&args) {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    let config = build_config(&args)?;
    info!("Starting jobsys with {config:?}");
    let scheduler = Scheduler::initialize(config).context("starting the scheduler")?;
    let counters = Arc::new(FrameCounters::default());

    for frame in 0..args.frames {
        let started = Instant::now();
        let pending = queue_frame(&scheduler, frame, args.jobs_per_frame, &counters)?;

        // render prep first, so its main-thread follow-ups are queued
        let (prepares, presents): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);
        for (_, prepare) in prepares {
            scheduler.wait_and_release(prepare)?;
        }

        let executed = scheduler.begin_frame();
        for (_, present) in presents {
            if scheduler.config().main_category.is_some() {
                // budgeted frames may leave some for the next frame
                while scheduler.job_state(&present)? != JobState::Finished {
                    scheduler.begin_frame();
                }
            } else {
                scheduler.wait(&present)?;
            }
            scheduler.release(present)?;
        }

        let stats = scheduler.stats();
        info!(
            "frame {frame}: {executed} main jobs in {:?}, live jobs {}, executed {}, failed {}",
            started.elapsed(),
            stats.live_jobs,
            stats.executed,
            stats.failed
        );
        if stats.failed > 0 {
            warn!("{} jobs failed so far", stats.failed);
        }
    }

    info!(
        "Stopping jobsys: logged {}, loaded {}, prepared {}, presented {}",
        counters.logged.load(Ordering::Relaxed),
        counters.loaded.load(Ordering::Relaxed),
        counters.prepared.load(Ordering::Relaxed),
        counters.presented.load(Ordering::Relaxed)
    );
    let stats = scheduler.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    scheduler.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("jobsys").chain(argv.iter().copied()))
    }

    #[test]
    fn budget_and_drain_all_conflict() {
        let args = parse(&["--drain", "all", "--frame-budget-ms", "3"]);
        assert!(validate_args(&args).is_err());
    }

    #[test]
    fn few_categories_have_no_main() {
        let args = parse(&["--categories", "3", "--workers", "2"]);
        validate_args(&args).unwrap();
        let config = build_config(&args).unwrap();
        assert_eq!(config.main_category, None);
        assert_eq!(lane(&config, Category::RENDER), Category::GENERIC);
        assert_eq!(lane(&config, Category::IO), Category::IO);
    }

    #[test]
    fn frame_budget_implies_budgeted_drain() {
        let args = parse(&["--frame-budget-ms", "2"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.drain, DrainPolicy::Budgeted);
        assert_eq!(config.frame_budget(), Some(Duration::from_millis(2)));
    }
}
