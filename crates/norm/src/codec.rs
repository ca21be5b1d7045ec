//! The pluggable FEC codec boundary (§1: "the core specifies the
//! interface it requires from a codec, not a concrete Reed–Solomon
//! implementation"), plus one concrete codec: systematic single-parity
//! XOR, enough to exercise erasure recovery end to end without pulling
//! in an external Reed–Solomon crate.
//!
//! This is additive relative to the distilled module list — see
//! DESIGN.md's grounding entry for why a codec boundary belongs in a
//! complete implementation even though the reference NORM ships several
//! interchangeable FEC schemes behind exactly this kind of seam.

/// What a source or parity block's encoder/decoder needs to know about
/// its own shape. `symbol_size` is fixed per block (the largest source
/// segment seen, per `normSegment.h`'s `seg_size_max`); shorter source
/// segments are treated as zero-padded for the purposes of parity math.
#[derive(Clone, Copy, Debug)]
pub struct BlockShape {
	pub num_data: u16,
	pub num_parity: u16,
	pub symbol_size: usize,
}

/// A pluggable forward error correction codec. Implementations operate
/// on fixed-size symbols; callers are responsible for segment-size
/// bookkeeping and zero-padding short segments up to `symbol_size`.
pub trait FecCodec {
	/// Generate parity symbol `parity_index` (0-based within the
	/// parity range) from a complete set of `shape.num_data` source
	/// symbols.
	fn encode(&self, shape: BlockShape, source: &[&[u8]], parity_index: u16, out: &mut [u8]);

	/// Attempt to reconstruct missing source symbols given whatever mix
	/// of source and parity symbols is available. `symbols[i]` is
	/// `Some` for every received source (`i < num_data`) or parity
	/// (`i >= num_data`) symbol index, `None` for erasures. Returns
	/// `true` if enough symbols were available to fill in every
	/// erasure among the first `num_data` entries.
	fn decode(&self, shape: BlockShape, symbols: &mut [Option<Vec<u8>>]) -> bool;
}

/// Systematic single-parity-symbol XOR codec: one parity symbol is the
/// XOR of every source symbol, zero-padded to `symbol_size`. Recovers
/// exactly one erasure per block — a deliberately minimal reference
/// codec, not a substitute for a real Reed–Solomon scheme at
/// `num_parity > 1`.
#[derive(Clone, Copy, Debug, Default)]
pub struct XorCodec;

impl XorCodec {
	fn xor_into(out: &mut [u8], symbol: &[u8]) {
		for (o, s) in out.iter_mut().zip(symbol.iter().chain(std::iter::repeat(&0u8))) {
			*o ^= s;
		}
	}
}

impl FecCodec for XorCodec {
	fn encode(&self, shape: BlockShape, source: &[&[u8]], parity_index: u16, out: &mut [u8]) {
		debug_assert_eq!(parity_index, 0, "XorCodec only supports a single parity symbol");
		debug_assert!(out.len() >= shape.symbol_size);

		out[..shape.symbol_size].fill(0);
		for symbol in source {
			Self::xor_into(&mut out[..shape.symbol_size], symbol);
		}
	}

	fn decode(&self, shape: BlockShape, symbols: &mut [Option<Vec<u8>>]) -> bool {
		let missing: Vec<usize> = (0..shape.num_data as usize).filter(|&i| symbols[i].is_none()).collect();

		if missing.is_empty() {
			return true;
		}

		if missing.len() > 1 {
			return false;
		}

		let Some(Some(parity)) = symbols.get(shape.num_data as usize) else {
			return false;
		};

		let mut reconstructed = vec![0u8; shape.symbol_size];
		reconstructed.copy_from_slice(&parity[..shape.symbol_size.min(parity.len())]);
		if parity.len() < shape.symbol_size {
			reconstructed[parity.len()..].fill(0);
		}

		for (i, symbol) in symbols.iter().take(shape.num_data as usize).enumerate() {
			if i == missing[0] {
				continue;
			}
			if let Some(symbol) = symbol {
				Self::xor_into(&mut reconstructed, symbol);
			}
		}

		symbols[missing[0]] = Some(reconstructed);
		true
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn shape(num_data: u16, symbol_size: usize) -> BlockShape {
		BlockShape { num_data, num_parity: 1, symbol_size }
	}

	#[test]
	fn xor_parity_recovers_single_erasure() {
		let codec = XorCodec;
		let shape = shape(3, 4);

		let sources: Vec<Vec<u8>> = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10, 11, 12]];
		let refs: Vec<&[u8]> = sources.iter().map(|v| v.as_slice()).collect();

		let mut parity = vec![0u8; 4];
		codec.encode(shape, &refs, 0, &mut parity);

		let mut symbols: Vec<Option<Vec<u8>>> = vec![Some(sources[0].clone()), None, Some(sources[2].clone()), Some(parity)];

		assert!(codec.decode(shape, &mut symbols));
		assert_eq!(symbols[1].as_deref(), Some(sources[1].as_slice()));
	}

	#[test]
	fn xor_codec_cannot_recover_two_erasures() {
		let codec = XorCodec;
		let shape = shape(3, 4);

		let mut symbols: Vec<Option<Vec<u8>>> = vec![None, None, Some(vec![9, 10, 11, 12]), Some(vec![0, 0, 0, 0])];

		assert!(!codec.decode(shape, &mut symbols));
	}

	#[test]
	fn no_erasures_is_a_no_op_success() {
		let codec = XorCodec;
		let shape = shape(2, 4);

		let mut symbols: Vec<Option<Vec<u8>>> = vec![Some(vec![1, 2, 3, 4]), Some(vec![5, 6, 7, 8]), Some(vec![0, 0, 0, 0])];

		assert!(codec.decode(shape, &mut symbols));
	}
}
