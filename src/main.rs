#[macro_use]
extern crate clap;
use clap::{App, Arg, ArgGroup, SubCommand};

use failure::Error;

use log::{error, info, warn};
use simplelog;
use std::io;
use std::path::Path;

mod cli_utils;
mod file_processor;
mod index_io;
mod resolver;

use chrono::offset::Local;

use file_processor::GeometrySource;
use resolver::{CandidateFilter, ResolverConfig, ScoringMode};

fn main() {
    let local_time = Local::now();
    let time_offset = local_time.offset();
    // Configure logging
    simplelog::TermLogger::init(
        simplelog::LevelFilter::Info,
        simplelog::Config {
            offset: time_offset.clone(),
            ..simplelog::Config::default()
        },
        simplelog::TerminalMode::Stderr,
    )
    .ok();

    match do_main() {
        Ok(_) => info!("Process finished OK"),
        Err(err) => {
            error!("Process finished with an error: {}", err);
            std::process::exit(1);
        }
    };
}

fn create_index_command<P: AsRef<Path>>(
    dest_path: P,
    geo_json_path: P,
    id_property: &str,
    force: bool,
) -> Result<(), Error> {
    info!(
        "Generating index from geo-json {:?} ...",
        geo_json_path.as_ref()
    );

    let mut dest_file_buffer = dest_path.as_ref().to_path_buf();
    if dest_path.as_ref().is_dir() {
        dest_file_buffer.push("features.idx.bin");
    }
    let dest_file: &Path = dest_file_buffer.as_path();

    if dest_file.exists() && !force {
        warn!(
            "Index exists in {}. Skipping. Use --force to overwrite",
            dest_file.display()
        );
        return Ok(());
    }

    info!("Generating index into {} ...", dest_file.display());

    let index = index_io::build_index(geo_json_path, id_property)?;
    info!("Saving index information into {}", dest_file.display());
    index_io::save_index(&index, dest_file)?;

    Ok(())
}

// Column arguments are 1-based on the command line.
fn column_index(matches: &clap::ArgMatches, name: &str) -> usize {
    let column = value_t!(matches, name, usize).unwrap_or_else(|e| e.exit());
    if column == 0 {
        error!("Column numbers are 1-based; got --{} 0", name);
        std::process::exit(1);
    }
    column - 1
}

fn do_main() -> Result<(), Error> {
    let matches = App::new("nearest_join")
        .version("0.1.0")
        .about("Assign each entity in a tabular file the nearest (or best-overlapping) feature from a geo-json file")
        .subcommand(
            SubCommand::with_name("generate_index")
                .about("Generate a feature index file from geo-json")
                .arg(Arg::with_name("output")
                    .short("o")
                    .help("Output path or file for the generated index")
                    .takes_value(true)
                    .default_value(".")
                )
                .arg(Arg::with_name("force")
                    .short("f")
                    .long("force")
                    .help("Overwrite indexes")
                    .takes_value(false)
                )
                .arg(Arg::with_name("geo-json")
                    .short("g")
                    .required(true)
                    .help("Path for the geo-json file with the candidate features")
                    .takes_value(true)
                )
                .arg(Arg::with_name("feature-id")
                    .long("feature-id")
                    .required(true)
                    .help("Feature property used as the feature identifier (also the tie-break key)")
                    .takes_value(true)
                )
        )
        .subcommand(
            SubCommand::with_name("resolve")
                .about("Assign each entity row its best-scoring feature")
                .arg(Arg::with_name("output")
                    .short("o")
                    .long("output")
                    .help("Sets the output file to create. If omitted, stdout will be used.")
                    .takes_value(true)
                )
                .group(ArgGroup::with_name("feature-source")
                    .args(&["index", "geo-file"])
                    .required(true))
                .arg(Arg::with_name("index")
                    .short("x")
                    .long("index")
                    .help("Use a prebuilt index instead of a geo-json file.")
                    .takes_value(true)
                )
                .arg(Arg::with_name("geo-file")
                    .short("g")
                    .long("geo-file")
                    .help("Path for the geo-json file. Index will be generated on the fly.")
                    .takes_value(true)
                )
                .arg(Arg::with_name("feature-id")
                    .long("feature-id")
                    .required_unless("index")
                    .help("Feature property used as the feature identifier (also the tie-break key)")
                    .takes_value(true)
                )
                .arg(Arg::with_name("input")
                    .short("i")
                    .long("input")
                    .help("Sets the input file to use. If omitted, stdin will be used.")
                    .takes_value(true)
                )
                .arg(Arg::with_name("delimiter")
                    .short("d")
                    .long("delimiter")
                    .help("Delimiter for input file fields")
                    .takes_value(true)
                    .default_value("\t"),
                )
                .group(ArgGroup::with_name("entity-geometry")
                    .args(&["geometry", "latitude"])
                    .required(true))
                .arg(Arg::with_name("geometry")
                    .long("geometry")
                    .help("Sets the column number that contains the entity geometry as geo-json text. 1 based.")
                    .takes_value(true)
                )
                .arg(Arg::with_name("latitude")
                    .long("latitude")
                    .requires("longitude")
                    .help("Sets the column number that contains the latitude. 1 based.")
                    .takes_value(true)
                )
                .arg(Arg::with_name("longitude")
                    .long("longitude")
                    .requires("latitude")
                    .help("Sets the column number that contains the longitude. 1 based.")
                    .takes_value(true)
                )
                .arg(Arg::with_name("mode")
                    .short("m")
                    .long("mode")
                    .help("Scoring mode for the entity/feature pairs")
                    .takes_value(true)
                    .possible_values(&["min_distance", "max_overlap_area"])
                    .default_value("min_distance")
                )
                .arg(Arg::with_name("max-distance")
                    .long("max-distance")
                    .help("Entities farther than this from every feature stay unassigned (min_distance mode).")
                    .takes_value(true)
                )
                .arg(Arg::with_name("min-overlap")
                    .long("min-overlap")
                    .help("Entities whose best overlap is below this stay unassigned (max_overlap_area mode).")
                    .takes_value(true)
                )
                .arg(Arg::with_name("filter")
                    .long("filter")
                    .help("Restrict candidate features by property equality, e.g. fclass=primary. Repeatable.")
                    .takes_value(true)
                    .multiple(true)
                    .number_of_values(1)
                )
                .arg(Arg::with_name("properties")
                    .short("p")
                    .long("properties")
                    .help("Properties of the selected feature to copy into the output.")
                    .takes_value(true)
                    .multiple(true)
                )
                .arg(Arg::with_name("with-header")
                    .long("with-header")
                    .help("Specifies that the input file contains a header.")
                )
                .arg(Arg::with_name("write-match-status")
                    .long("write-match-status")
                    .help("Write an extra column indicating whether each row was matched, unmatched or invalid.")
                )
        )
        .get_matches();

    if let Some(generate_matches) = matches.subcommand_matches("generate_index") {
        return create_index_command(
            generate_matches.value_of("output").unwrap_or_default(),
            generate_matches.value_of("geo-json").unwrap_or_default(),
            generate_matches.value_of("feature-id").expect("feature-id"),
            generate_matches.is_present("force"),
        );
    }

    if let Some(run_matches) = matches.subcommand_matches("resolve") {
        let scoring_mode = run_matches
            .value_of("mode")
            .unwrap_or_default()
            .parse::<ScoringMode>()?;

        let mut config = ResolverConfig::new(scoring_mode);
        if run_matches.is_present("max-distance") {
            config.max_distance =
                Some(value_t!(run_matches, "max-distance", f64).unwrap_or_else(|e| e.exit()));
        }
        if run_matches.is_present("min-overlap") {
            config.min_overlap =
                Some(value_t!(run_matches, "min-overlap", f64).unwrap_or_else(|e| e.exit()));
        }
        let filters: Vec<_> = run_matches
            .values_of("filter")
            .unwrap_or_default()
            .collect();
        config.filter = CandidateFilter::parse(&filters)?;
        config.validate()?;

        let index = if run_matches.is_present("index") {
            let index_path = Path::new(run_matches.value_of("index").expect("index"));

            index_io::load_index(index_path)?
        } else if run_matches.is_present("geo-file") {
            let geo_json_path = Path::new(run_matches.value_of("geo-file").expect("geo-file"));
            let id_property = run_matches.value_of("feature-id").expect("feature-id");

            index_io::build_index(geo_json_path, id_property)?
        } else {
            error!("Either geo-file or index must be indicated.");
            std::process::exit(1)
        };

        info!("Using an index with {} features", index.len());

        let geometry_source = if run_matches.is_present("geometry") {
            GeometrySource::GeoJsonColumn(column_index(run_matches, "geometry"))
        } else {
            GeometrySource::LonLatColumns {
                longitude: column_index(run_matches, "longitude"),
                latitude: column_index(run_matches, "latitude"),
            }
        };

        let properties: Vec<String> = run_matches
            .values_of("properties")
            .unwrap_or_default()
            .map(String::from)
            .collect();

        // Parse the delimiter. Should be exactly one character.
        let delimiter = run_matches
            .value_of("delimiter")
            .unwrap_or_default()
            .replace("\\t", "\t");
        let char_delimiter: u8 = delimiter.as_bytes()[0];
        info!("Using the following delimiter: {:?}", char_delimiter);

        let input_file_path = run_matches.value_of("input");

        let stdin = io::stdin();
        let (mut input_file, input_file_size): (Box<dyn io::Read>, Option<u64>) =
            match input_file_path {
                Some(path) => {
                    let input_file = std::fs::File::open(path)?;
                    let file_size = input_file.metadata()?.len();
                    (Box::new(input_file), Some(file_size))
                }
                None => {
                    info!("Reading from stdin");
                    (Box::new(stdin.lock()), None)
                }
            };

        let output_file_path = run_matches.value_of("output");

        let stdout = io::stdout();
        let mut output_file: Box<dyn io::Write> = match output_file_path {
            Some(path) => {
                info!("Writing to file {}.", path);
                Box::new(std::fs::File::create(path)?)
            }
            None => {
                info!("Writing to stdout");
                Box::new(stdout.lock())
            }
        };

        let stats = file_processor::assign_features(
            &index,
            &config,
            input_file.as_mut(),
            input_file_size,
            output_file.as_mut(),
            char_delimiter,
            &geometry_source,
            &properties,
            run_matches.is_present("with-header"),
            run_matches.is_present("write-match-status"),
        )?;

        info!("Stats: {:?}", stats);
    }

    Ok(())
}
