// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use clap::Parser;
use jobsys::{Category, JobHandle, JobState, Scheduler, SchedulerConfig};
use jobsys_tests::test_log::Recorder;
use log::{debug, info};

/// Runs a few frames of I/O -> render -> main chains and prints the
/// execution trace as JSON on the last line.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, default_value_t = 3)]
    frames: u32,

    #[arg(long, default_value_t = 4)]
    chains: u32,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Drain the main category with this budget instead of draining it fully
    #[arg(long, value_name = "MS")]
    budget_ms: Option<u64>,
}

fn recorded<P: Send + 'static>(
    recorder: &Recorder,
    name: String,
    category: Category,
) -> impl FnOnce(&mut P) -> anyhow::Result<()> + Send + 'static {
    let recorder = recorder.clone();
    move |_: &mut P| {
        recorder.record(name, category.0);
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .try_init();
    let args = Args::parse();

    let mut config = SchedulerConfig::default().with_workers(args.workers);
    if let Some(ms) = args.budget_ms {
        config = config.with_frame_budget(Duration::from_millis(ms));
    }
    let scheduler = Scheduler::initialize(config)?;
    let recorder = Recorder::new();

    for frame in 0..args.frames {
        let mut presents: Vec<JobHandle> = Vec::new();
        for chain in 0..args.chains {
            let log = scheduler.run(
                Category::LOGGING,
                recorded::<()>(&recorder, format!("log-{frame}-{chain}"), Category::LOGGING),
                (),
            )?;
            scheduler.release(log)?;

            let load = scheduler.run(
                Category::IO,
                recorded::<()>(&recorder, format!("io-{frame}-{chain}"), Category::IO),
                (),
            )?;
            let prepare = scheduler
                .job(
                    Category::RENDER,
                    recorded::<()>(&recorder, format!("render-{frame}-{chain}"), Category::RENDER),
                    (),
                )
                .after(&load)
                .submit()?;
            let present = scheduler
                .job(
                    Category::MAIN,
                    recorded::<()>(&recorder, format!("main-{frame}-{chain}"), Category::MAIN),
                    (),
                )
                .after(&prepare)
                .submit()?;
            scheduler.release(load)?;
            scheduler.wait_and_release(prepare)?;
            presents.push(present);
        }

        let mut drains = 0;
        while !presents.is_empty() {
            scheduler.begin_frame();
            drains += 1;
            let mut waiting = Vec::new();
            for present in presents {
                if scheduler.job_state(&present)? == JobState::Finished {
                    scheduler.release(present)?;
                } else {
                    waiting.push(present);
                }
            }
            presents = waiting;
        }
        debug!("frame {frame}: main chains done after {drains} drains");
    }
    info!("traced {} frames, {} jobs recorded", args.frames, recorder.snapshot().events.len());

    scheduler.shutdown();
    println!("Event log: {}", serde_json::to_string(&recorder.snapshot())?);
    Ok(())
}
