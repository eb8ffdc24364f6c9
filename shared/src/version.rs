/// Packs a semantic version into the `u32` exchanged during authentication.
///
/// Layout is `major:10 | minor:10 | patch:12`, which keeps version comparisons a plain integer
/// comparison.
#[must_use]
pub const fn build_version(major: u32, minor: u32, patch: u32) -> u32 {
	major << 22 | minor << 12 | patch
}

#[must_use]
pub const fn decode_version(version: u32) -> (u32, u32, u32) {
	((version >> 22) & 0x3FF, (version >> 12) & 0x3FF, version & 0xFFF)
}

/// Version advertised by this build.
pub const GAME_VERSION: u32 = build_version(0, 3, 1);

/// Oldest client version the server still accepts.
pub const PROTOCOL_REQUIRED_CLIENT_VERSION: u32 = build_version(0, 3, 0);

/// First protocol version where chunk payloads are LZ4 compressed on the wire.
pub const CHUNK_COMPRESSION_VERSION: u32 = build_version(0, 3, 1);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_packing_round_trips() {
		let version = build_version(0, 3, 1);
		assert_eq!(decode_version(version), (0, 3, 1));

		let version = build_version(2, 17, 409);
		assert_eq!(decode_version(version), (2, 17, 409));
	}

	#[test]
	fn versions_order_as_integers() {
		assert!(build_version(0, 2, 9) < build_version(0, 3, 0));
		assert!(build_version(0, 3, 0) < build_version(0, 3, 1));
		assert!(build_version(0, 3, 1) < build_version(1, 0, 0));
	}
}
