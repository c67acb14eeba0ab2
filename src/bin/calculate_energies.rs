use std::{error::Error, path::Path, process};

use log::info;
use qmlabel::{
    catalog::TASKS_DIR, pipeline::Pipeline, program::from_settings,
    settings::Settings,
};

const USAGE: &str =
    "usage: calculate_energies <temp dir> <output dir> <num workers> [settings.json]";

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (temp_dir, output_dir, workers, settings) = match args.as_slice() {
        [t, o, w] => (t, o, w, Settings::default()),
        [t, o, w, s] => (t, o, w, Settings::load(s)?),
        _ => {
            eprintln!("{USAGE}");
            process::exit(1);
        }
    };
    let workers: usize = workers
        .parse()
        .map_err(|e| format!("invalid number of workers `{workers}`: {e}"))?;

    let program = from_settings(&settings);
    info!("labeling with {} ({})", program.name(), settings.qm_method);
    let pipeline = Pipeline::new(
        Path::new(temp_dir).join(TASKS_DIR),
        Path::new(output_dir).join(TASKS_DIR),
        workers,
    );
    let summary = pipeline.run(program.as_ref(), &settings)?;
    println!(
        "{} tasks, {} energies, {} missing",
        summary.tasks, summary.energies, summary.missing
    );
    Ok(())
}
