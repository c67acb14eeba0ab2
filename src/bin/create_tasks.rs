use std::{error::Error, path::PathBuf, process};

use qmlabel::catalog::create_from_files;

const USAGE: &str =
    "usage: create_tasks <flavor file> <geometry file> <num molecules> <output dir>";

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [flavor_file, xyz_file, num_molecules, output_dir] = args.as_slice()
    else {
        eprintln!("{USAGE}");
        process::exit(1);
    };
    let num_molecules: usize = num_molecules
        .parse()
        .map_err(|e| format!("invalid number of molecules `{num_molecules}`: {e}"))?;

    let catalog = create_from_files(
        flavor_file,
        xyz_file,
        num_molecules,
        PathBuf::from(output_dir),
        &mut rand::thread_rng(),
    )?;
    println!("{}", catalog.root.display());
    Ok(())
}
