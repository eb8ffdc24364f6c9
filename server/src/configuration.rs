use serde::Deserialize;
use std::{fs::File, io, io::Read, str, str::Utf8Error};
use thiserror::Error;

#[derive(Deserialize)]
#[serde(default)]
pub struct Configuration {
	pub listen_address: Box<str>,
	pub max_players: usize,

	/// Seed for deterministic terrain generation.
	pub world_seed: u64,

	/// Optional shared secret clients must present in their auth request.
	pub connection_token: Option<Box<str>>,

	pub save_directory: Box<str>,
}

impl Default for Configuration {
	fn default() -> Self {
		Self {
			listen_address: Box::from("0.0.0.0:29560"),
			max_players: 64,
			world_seed: 0,
			connection_token: None,
			save_directory: Box::from(lodestone_shared::constants::SAVE_DIRECTORY),
		}
	}
}

impl Configuration {
	pub fn load() -> Result<Configuration, ConfigurationLoadError> {
		let mut file = match File::open("server.conf") {
			Ok(file) => file,
			Err(error) if error.kind() == io::ErrorKind::NotFound => {
				log::info!("no server.conf found, using defaults");
				return Ok(Configuration::default());
			}
			Err(error) => return Err(error.into()),
		};

		let length = file.metadata()?.len() as usize;
		let mut buffer = vec![0; length];
		file.read_exact(&mut buffer)?;
		Ok(hocon::de::from_str(str::from_utf8(&buffer)?)?)
	}
}

#[derive(Debug, Error)]
#[error(transparent)]
pub enum ConfigurationLoadError {
	Io(#[from] io::Error),
	Utf8(#[from] Utf8Error),
	Parse(#[from] hocon::Error),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hocon_overrides_defaults() {
		let configuration: Configuration = hocon::de::from_str(
			"listen_address: \"127.0.0.1:4000\"\nworld_seed: 99\nconnection_token: \"hunter2\"",
		)
		.expect("configuration must parse");

		assert_eq!(&*configuration.listen_address, "127.0.0.1:4000");
		assert_eq!(configuration.world_seed, 99);
		assert_eq!(configuration.connection_token.as_deref(), Some("hunter2"));
		assert_eq!(configuration.max_players, Configuration::default().max_players);
	}
}
