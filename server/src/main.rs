#![deny(clippy::unwrap_used)]

mod chunk_entities;
mod configuration;
mod entities;
mod instance;
mod persistence;
mod player;
mod session;
mod visibility;

use crate::{configuration::Configuration, instance::ServerInstance};
use anyhow::Result;
use lodestone_shared::shared_main;
use std::convert::Infallible;
use std::{env, fs};

fn main() -> Result<Infallible> {
	let _runtime = shared_main()?;

	// Avoid altering project files if running in Cargo
	if env::var("CARGO").is_ok() {
		let mut working_directory = env::current_dir()?;
		working_directory.push("server/run");

		fs::create_dir_all(&working_directory)?;
		env::set_current_dir(working_directory)?;
	}

	let configuration = Configuration::load()?;
	let instance = ServerInstance::new(configuration)?;

	instance.run()
}
