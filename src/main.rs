use std::fs;
use std::io::{self, prelude::*};
use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ext_memory::{ExternalSorterBuilder, Sequence, SequenceWriter, StorageConfig, StorageSubsystem};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let order: Order = arg_parser.value_of_t_or_exit("sort");
    let memory = parse_size(arg_parser.value_of("memory"));
    let block_size = parse_size(arg_parser.value_of("block_size"));
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let generate: Option<u64> = arg_parser
        .is_present("generate")
        .then(|| arg_parser.value_of_t_or_exit("generate"));
    let seed: u64 = arg_parser.value_of_t_or_exit("seed");

    let input = path::Path::new(arg_parser.value_of("input").unwrap_or_default());
    let output = path::Path::new(arg_parser.value_of("output").unwrap_or_default());

    let config = match arg_parser.value_of("config") {
        Some(config) => StorageConfig::from_file(path::Path::new(config)),
        None => StorageConfig::from_env(),
    };
    let storage = match config.and_then(StorageSubsystem::open) {
        Ok(storage) => storage,
        Err(err) => {
            log::error!("storage initialization error: {}", err);
            process::exit(1);
        }
    };

    if let Some(count) = generate {
        if let Err(err) = generate_input(input, count, seed) {
            log::error!("input generation error: {}", err);
            process::exit(1);
        }
        log::info!("generated {} records into {}", count, input.display());
    }

    let input_stream = match fs::File::open(input) {
        Ok(file) => io::BufReader::new(file),
        Err(err) => {
            log::error!("input file opening error: {}", err);
            process::exit(1);
        }
    };

    let mut output_stream = match fs::File::create(output) {
        Ok(file) => io::BufWriter::new(file),
        Err(err) => {
            log::error!("output file creation error: {}", err);
            process::exit(1);
        }
    };

    let mut sorter_builder = ExternalSorterBuilder::new()
        .with_storage(storage.clone())
        .with_memory(memory)
        .with_block_size(block_size);
    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    let sorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    let before = storage.stats();
    let records = match load_input(input_stream, storage.clone(), block_size) {
        Ok(records) => records,
        Err(err) => {
            log::error!("input loading error: {}", err);
            process::exit(1);
        }
    };

    let sorted = match order {
        Order::Asc => sorter.sort(&records),
        Order::Desc => sorter.sort_by(&records, |a: &u64, b: &u64| a.cmp(b).reverse()),
    };
    let sorted = match sorted {
        Ok(sorted) => sorted,
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    };
    drop(records);

    let reader = match sorted.reader(ext_memory::sequence::DEFAULT_WINDOW) {
        Ok(reader) => reader,
        Err(err) => {
            log::error!("sorted data reading error: {}", err);
            process::exit(1);
        }
    };
    for record in reader {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                log::error!("sorted stream error: {}", err);
                process::exit(1);
            }
        };
        if let Err(err) = output_stream.write_all(&record.to_le_bytes()) {
            log::error!("data saving error: {}", err);
            process::exit(1);
        };
    }

    if let Err(err) = output_stream.flush() {
        log::error!("data flushing error: {}", err);
        process::exit(1);
    }

    println!("{} records sorted\n{}", sorted.len(), storage.stats() - before);
}

fn parse_size(value: Option<&str>) -> usize {
    match value.map(|value| value.parse::<ByteSize>()) {
        Some(Ok(size)) => size.as_u64() as usize,
        _ => {
            log::error!("size format incorrect");
            process::exit(1);
        }
    }
}

/// Writes `count` random little-endian `u64` records.
fn generate_input(path: &path::Path, count: u64, seed: u64) -> io::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stream = io::BufWriter::new(fs::File::create(path)?);
    for _ in 0..count {
        stream.write_all(&rng.gen::<u64>().to_le_bytes())?;
    }
    stream.flush()
}

fn load_input<R: Read>(
    mut stream: R,
    storage: std::sync::Arc<StorageSubsystem>,
    block_size: usize,
) -> Result<Sequence<u64>, String> {
    let mut writer = SequenceWriter::new(
        storage,
        block_size,
        Default::default(),
        ext_memory::sequence::DEFAULT_WINDOW,
        None,
    )
    .map_err(|err| err.to_string())?;

    let mut record = [0u8; 8];
    let mut filled = 0;
    loop {
        match stream.read(&mut record[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.to_string()),
        }
        if filled == record.len() {
            writer.push(u64::from_le_bytes(record)).map_err(|err| err.to_string())?;
            filled = 0;
        }
    }
    if filled != 0 {
        return Err(format!(
            "input ends with a partial record of {} bytes after {} records",
            filled,
            writer.len()
        ));
    }

    writer.finish().map_err(|err| err.to_string())
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum Order {
    Asc,
    Desc,
}

impl Order {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Order::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for Order {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <Order as clap::ArgEnum>::from_str(s, false)
    }
}

fn size_validator(value: &str) -> Result<(), String> {
    match value.parse::<ByteSize>() {
        Ok(_) => Ok(()),
        Err(err) => Err(format!("size format incorrect: {}", err)),
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-memory")
        .about("sorts a file of little-endian u64 records in external memory")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file of records to be sorted")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sort")
                .short('s')
                .long("sort")
                .help("sorting order")
                .takes_value(true)
                .default_value("asc")
                .possible_values(Order::possible_values()),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("disk configuration file, $EXTMEM_CONFIG or a scratch disk otherwise")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("memory")
                .short('m')
                .long("memory")
                .help("memory budget")
                .takes_value(true)
                .default_value("128MiB")
                .validator(size_validator),
        )
        .arg(
            clap::Arg::new("block_size")
                .short('b')
                .long("block-size")
                .help("block size, a power of two")
                .takes_value(true)
                .default_value("2MiB")
                .validator(size_validator),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel run sorting")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("generate")
                .short('g')
                .long("generate")
                .help("write this many random records to the input file first")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("seed")
                .long("seed")
                .help("seed of generated records")
                .takes_value(true)
                .default_value("0"),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::load_input;
    use ext_memory::{StorageConfig, StorageSubsystem, PAGE_SIZE};

    #[rstest]
    #[case(0, 0)]
    #[case(3, 0)]
    #[case(1000, 0)]
    #[case(1000, 5)]
    fn test_load_input(#[case] records: u64, #[case] trailing: usize) {
        let storage = StorageSubsystem::open(StorageConfig::memory(1, 0)).unwrap();
        let mut bytes: Vec<u8> = (0..records).flat_map(|record| record.to_le_bytes()).collect();
        bytes.extend(std::iter::repeat(0xab).take(trailing));

        let result = load_input(bytes.as_slice(), storage, PAGE_SIZE);
        if trailing == 0 {
            assert_eq!(result.unwrap().to_vec().unwrap(), (0..records).collect::<Vec<_>>());
        } else {
            let err = result.err().unwrap();
            assert!(err.contains("partial record of 5 bytes after 1000 records"), "{}", err);
        }
    }
}
