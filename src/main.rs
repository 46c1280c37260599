use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use pinbook::config::Config;
use pinbook::{logging, AlbumCoordinator, AlbumStatus, DownloadManager, FlickrClient, Pin, Store};

enum Command {
    Pins,
    Add { latitude: String, longitude: String },
    Remove { latitude: String, longitude: String },
    Album { latitude: String, longitude: String },
    Refresh { latitude: String, longitude: String },
}

struct Args {
    config_path: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = None;
    let mut positional = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("pinbook {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let coordinate = |positional: &[String]| -> (String, String) {
        match positional {
            [_, lat, lon] => (lat.clone(), lon.clone()),
            _ => {
                eprintln!("Error: {} requires LAT and LON", positional[0]);
                std::process::exit(1);
            }
        }
    };

    let command = match positional.first().map(String::as_str) {
        None | Some("pins") => Command::Pins,
        Some("add") => {
            let (latitude, longitude) = coordinate(&positional);
            Command::Add { latitude, longitude }
        }
        Some("remove") => {
            let (latitude, longitude) = coordinate(&positional);
            Command::Remove { latitude, longitude }
        }
        Some("album") => {
            let (latitude, longitude) = coordinate(&positional);
            Command::Album { latitude, longitude }
        }
        Some("refresh") => {
            let (latitude, longitude) = coordinate(&positional);
            Command::Refresh { latitude, longitude }
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            print_help();
            std::process::exit(1);
        }
    };

    Args { config_path, command }
}

fn print_help() {
    println!(
        r#"pinbook - location bookmarks with cached photo albums

USAGE:
    pinbook [OPTIONS] [COMMAND]

COMMANDS:
    pins                List saved pins (default)
    add LAT LON         Save a pin
    remove LAT LON      Delete a pin and its photos
    album LAT LON       Load the pin's album and download missing images
    refresh LAT LON     Replace the pin's album with a new collection

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    PINBOOK_CONFIG      Path to config file (overrides default location)
    PINBOOK_LOG         Log level (trace, debug, info, warn, error)
    FLICKR_API_KEY      Flickr API key when not set in the config file

Config file location: $XDG_CONFIG_HOME/pinbook/config.toml"#
    );
}

fn require_pin(store: &Store, latitude: &str, longitude: &str) -> Result<Pin> {
    store
        .find_pin(latitude, longitude)?
        .with_context(|| format!("No pin at {}, {}", latitude, longitude))
}

fn print_status(status: AlbumStatus) {
    match status {
        AlbumStatus::Ready(count) => println!("{} photos in album", count),
        AlbumStatus::NoPhotos => println!("{}", pinbook::album::NO_PHOTOS_MESSAGE),
    }
}

/// Download every photo that has no cached bytes yet.
fn download_missing(album: &mut AlbumCoordinator, store: &Store, pin: &Pin) -> Result<()> {
    let mut downloaded = 0;
    let mut failed = 0;

    for photo in store.list_photos(pin)? {
        if photo.is_cached() {
            continue;
        }
        match album.image_for(&photo) {
            Ok(bytes) => {
                downloaded += 1;
                tracing::debug!(photo_id = photo.id, size = bytes.len(), "Image cached");
            }
            Err(e) if e.is_silent() => {}
            Err(e) => {
                failed += 1;
                tracing::error!(url = %photo.source_url, error = %e, "Image download failed");
            }
        }
    }

    if failed > 0 {
        println!("{} images downloaded, {} failed", downloaded, failed);
    } else {
        println!("{} images downloaded", downloaded);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let config = match args.config_path {
        Some(path) => Config::load_from(&path)?,
        None => Config::load()?,
    };

    let store = Arc::new(Store::open(&config.db_path)?);
    store.initialize()?;

    let refresh = matches!(args.command, Command::Refresh { .. });
    match args.command {
        Command::Pins => {
            for pin in store.list_pins()? {
                let photos = store.list_photos(&pin)?;
                let cached = photos.iter().filter(|p| p.is_cached()).count();
                println!(
                    "{}, {}\t{} photos ({} cached)",
                    pin.latitude,
                    pin.longitude,
                    photos.len(),
                    cached
                );
            }
        }
        Command::Add { latitude, longitude } => {
            let pin = store.create_pin(&latitude, &longitude)?;
            println!("Pin saved at {}, {}", pin.latitude, pin.longitude);
        }
        Command::Remove { latitude, longitude } => {
            let pin = require_pin(&store, &latitude, &longitude)?;
            store.delete_pin(&pin)?;
            println!("Pin removed");
        }
        Command::Album { latitude, longitude } | Command::Refresh { latitude, longitude } => {
            if config.search.resolved_api_key().is_none() {
                bail!("No Flickr API key: set search.api_key or FLICKR_API_KEY");
            }

            let pin = require_pin(&store, &latitude, &longitude)?;
            let search = Arc::new(FlickrClient::from_config(&config.search));
            let downloads = DownloadManager::from_config(&config.download);
            let mut album = AlbumCoordinator::new(Arc::clone(&store), search, downloads);

            let status = if refresh {
                album.request_new_collection(&pin)?
            } else {
                album.ensure_loaded(&pin)?
            };
            print_status(status);

            download_missing(&mut album, &store, &pin)?;
        }
    }

    store.flush().await?;
    Ok(())
}
