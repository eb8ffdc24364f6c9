#![deny(clippy::unwrap_used)]

mod chunk_entities;
mod client;
mod prediction;
mod session;
mod world;

use anyhow::Result;
use clap::Parser;
use client::{Client, IdleFrontend};
use lodestone_shared::shared_main;
use log::info;

#[derive(Parser)]
pub struct Arguments {
	/// Disables vsync
	#[arg(long)]
	pub no_vsync: bool,

	/// Window width
	#[arg(long, default_value_t = 1280)]
	pub width: u32,

	/// Window height
	#[arg(long, default_value_t = 720)]
	pub height: u32,

	/// Server to connect to, `host` or `host:port`
	#[arg(long)]
	pub server_address: Option<String>,

	/// Name shown to other players
	#[arg(long)]
	pub nickname: Option<String>,

	/// Skip the menu and connect to the given server immediately
	#[arg(long)]
	pub auto_connect: bool,
}

fn main() -> Result<()> {
	let arguments = Arguments::parse();
	let _runtime = shared_main()?;

	info!(
		"display: {}x{}, vsync {}",
		arguments.width,
		arguments.height,
		if arguments.no_vsync { "off" } else { "on" }
	);

	if !arguments.auto_connect {
		info!("pass --auto-connect with --server-address to join a server directly");
		return Ok(());
	}

	let client = Client::connect(&arguments)?;
	Ok(client.run(&mut IdleFrontend)?)
}
