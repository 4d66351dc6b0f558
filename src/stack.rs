//! Stack assembly: decode raw kernel stack bytes, resolve each frame, and
//! build the emitted frame list.

use crate::bpf::bindings::MAX_STACK_DEPTH;
use crate::symbols::SymbolResolver;

/// Reusable frame accumulator. One builder serves a whole harvest; callers
/// `reset` between samples.
#[derive(Debug, Default)]
pub(crate) struct StackBuilder {
    frames: Vec<String>,
}

impl StackBuilder {
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    pub fn push(&mut self, frame: String) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn reverse(&mut self) {
        self.frames.reverse();
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }
}

/// Rendering of frames that did not resolve to a symbol name.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FrameFormat {
    /// `module+hex(start)` instead of the bare module name.
    pub module_offset: bool,
    /// `hex(ip)` instead of `[unknown]` when even the module is unknown.
    pub raw_address: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackResolveStats {
    pub known: u32,
    pub unknown_symbols: u32,
    pub unknown_modules: u32,
}

/// Walks up to [`MAX_STACK_DEPTH`] little-endian frames, stopping at the
/// first zero pointer, and appends the resolved names to `builder` in
/// root-first order (the kernel hands them leaf-first).
pub(crate) fn walk_stack(
    builder: &mut StackBuilder,
    stack: &[u8],
    resolver: &dyn SymbolResolver,
    format: FrameFormat,
    stats: &mut StackResolveStats,
) {
    if stack.is_empty() {
        return;
    }
    let mut frames = Vec::new();
    for chunk in stack.chunks_exact(8).take(MAX_STACK_DEPTH) {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(chunk);
        let ip = u64::from_le_bytes(raw);
        if ip == 0 {
            break;
        }
        let sym = resolver.resolve(ip);
        let name = if !sym.name.is_empty() {
            stats.known += 1;
            sym.name
        } else if !sym.module.is_empty() {
            stats.unknown_symbols += 1;
            if format.module_offset {
                format!("{}+{:x}", sym.module, sym.start)
            } else {
                sym.module
            }
        } else {
            stats.unknown_modules += 1;
            if format.raw_address {
                format!("{ip:x}")
            } else {
                "[unknown]".to_string()
            }
        };
        frames.push(name);
    }
    frames.reverse();
    for frame in frames {
        builder.push(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::Symbol;
    use std::collections::HashMap;

    struct ConstResolver(&'static str);

    impl SymbolResolver for ConstResolver {
        fn resolve(&self, _address: u64) -> Symbol {
            Symbol {
                name: self.0.to_string(),
                module: String::new(),
                start: 0,
            }
        }
    }

    struct MapResolver(HashMap<u64, Symbol>);

    impl SymbolResolver for MapResolver {
        fn resolve(&self, address: u64) -> Symbol {
            self.0.get(&address).cloned().unwrap_or_default()
        }
    }

    fn stack_bytes(ips: &[u64]) -> Vec<u8> {
        let mut bytes = vec![0u8; MAX_STACK_DEPTH * 8];
        for (i, ip) in ips.iter().enumerate() {
            bytes[i * 8..i * 8 + 8].copy_from_slice(&ip.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn resolves_until_the_first_zero_pointer() {
        let mut builder = StackBuilder::default();
        let mut stats = StackResolveStats::default();
        walk_stack(
            &mut builder,
            &stack_bytes(&[0xa, 0xb, 0xc]),
            &ConstResolver("f"),
            FrameFormat::default(),
            &mut stats,
        );
        assert_eq!(builder.frames(), ["f", "f", "f"]);
        assert_eq!(stats.known, 3);
    }

    #[test]
    fn appends_frames_root_first() {
        let symbols = HashMap::from([
            (0x10, Symbol { name: "leaf".into(), module: String::new(), start: 0 }),
            (0x20, Symbol { name: "mid".into(), module: String::new(), start: 0 }),
            (0x30, Symbol { name: "root".into(), module: String::new(), start: 0 }),
        ]);
        let mut builder = StackBuilder::default();
        let mut stats = StackResolveStats::default();
        walk_stack(
            &mut builder,
            &stack_bytes(&[0x10, 0x20, 0x30]),
            &MapResolver(symbols),
            FrameFormat::default(),
            &mut stats,
        );
        assert_eq!(builder.frames(), ["root", "mid", "leaf"]);
    }

    #[test]
    fn depth_is_capped() {
        let ips: Vec<u64> = (1..=200).collect();
        let mut bytes = Vec::new();
        for ip in &ips {
            bytes.extend_from_slice(&ip.to_le_bytes());
        }
        let mut builder = StackBuilder::default();
        let mut stats = StackResolveStats::default();
        walk_stack(
            &mut builder,
            &bytes,
            &ConstResolver("f"),
            FrameFormat::default(),
            &mut stats,
        );
        assert_eq!(builder.len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn empty_stacks_add_nothing() {
        let mut builder = StackBuilder::default();
        let mut stats = StackResolveStats::default();
        walk_stack(
            &mut builder,
            &[],
            &ConstResolver("f"),
            FrameFormat::default(),
            &mut stats,
        );
        assert_eq!(builder.len(), 0);
        assert_eq!(stats, StackResolveStats::default());
    }

    #[test]
    fn unknown_symbol_formatting() {
        let symbols = HashMap::from([(
            0x1000,
            Symbol {
                name: String::new(),
                module: "libc.so".into(),
                start: 0xef,
            },
        )]);
        let resolver = MapResolver(symbols);

        // Known module, unknown symbol, with and without the offset.
        let mut builder = StackBuilder::default();
        let mut stats = StackResolveStats::default();
        walk_stack(
            &mut builder,
            &stack_bytes(&[0x1000]),
            &resolver,
            FrameFormat { module_offset: true, raw_address: false },
            &mut stats,
        );
        assert_eq!(builder.frames(), ["libc.so+ef"]);
        assert_eq!(stats.unknown_symbols, 1);

        builder.reset();
        walk_stack(
            &mut builder,
            &stack_bytes(&[0x1000]),
            &resolver,
            FrameFormat::default(),
            &mut stats,
        );
        assert_eq!(builder.frames(), ["libc.so"]);

        // Unknown module, with and without the raw address.
        builder.reset();
        let mut stats = StackResolveStats::default();
        walk_stack(
            &mut builder,
            &stack_bytes(&[0xcafebabe]),
            &resolver,
            FrameFormat::default(),
            &mut stats,
        );
        assert_eq!(builder.frames(), ["[unknown]"]);
        assert_eq!(stats.unknown_modules, 1);

        builder.reset();
        walk_stack(
            &mut builder,
            &stack_bytes(&[0xcafebabe]),
            &resolver,
            FrameFormat { module_offset: false, raw_address: true },
            &mut stats,
        );
        assert_eq!(builder.frames(), ["cafebabe"]);
    }
}
