use std::{env, path::Path};

use color_eyre::eyre;
use dialoguer::Input;
use tracing::warn;

use mirroring::{Database, Mirror};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::try_init().map_err(|e| eyre::eyre!(e))?;

    let db_path = env::args().nth(1).unwrap_or_else(|| "mirror.db".to_owned());
    let mirror = Mirror::start(&db_path)?;

    loop {
        let input: String = Input::new().interact()?;

        let items = input.split_whitespace().collect::<Vec<_>>();

        match items.as_slice() {
            [] => (),
            ["/quit", ..] => {
                mirror.stop();
                return Ok(());
            }
            ["/add", paths @ ..] => {
                for path in paths {
                    match mirror.add_root(path) {
                        Ok(_) => println!(" :: now mirroring {}", path),
                        Err(e) => warn!(error = %e, "failed to add root"),
                    }
                }
            }
            ["/roots", ..] => {
                let db = Database::open(mirror.db_path())?;
                for root in db.list_roots()? {
                    println!(" - {}", root.display());
                }
            }
            ["/hash", paths @ ..] => {
                let db = Database::open(mirror.db_path())?;
                for path in paths {
                    match db.fingerprint_for(Path::new(path))? {
                        Some((crc, ed2k)) => println!(" - {}: crc={} ed2k={}", path, crc, ed2k),
                        None => println!(" - {}: not hashed yet", path),
                    }
                }
            }
            _ => println!("unrecognised command: {}", items.join(" ")),
        }
    }
}
