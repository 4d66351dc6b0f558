//! Kernel symbol table parsed from `/proc/kallsyms`, plus a [`SymbolCache`]
//! that knows nothing but kernel symbols.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};

use tracing::warn;

use crate::symbols::{
    CacheOptions, CacheStats, ProcTable, Symbol, SymbolCache, SymbolResolver,
};

pub const KALLSYMS_PATH: &str = "/proc/kallsyms";

const KERNEL_MODULE: &str = "kernel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSymbol {
    pub address: u64,
    pub name: String,
}

/// Sorted kernel symbol table. Resolution picks the closest preceding
/// symbol; addresses below the first symbol resolve to nothing.
#[derive(Debug, Default)]
pub struct Kallsyms {
    symbols: Vec<KernelSymbol>,
}

impl Kallsyms {
    pub fn load() -> io::Result<Self> {
        Self::from_reader(File::open(KALLSYMS_PATH)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> io::Result<Self> {
        let mut symbols = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (Some(address), Some(kind), Some(name)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            // Text, weak and data symbols; see `man nm` for the letters.
            if !matches!(kind, "T" | "t" | "W" | "D") {
                continue;
            }
            let Ok(address) = u64::from_str_radix(address, 16) else {
                continue;
            };
            symbols.push(KernelSymbol {
                address,
                name: name.to_string(),
            });
        }
        symbols.sort_by_key(|symbol| symbol.address);
        Ok(Self { symbols })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolResolver for Kallsyms {
    fn resolve(&self, address: u64) -> Symbol {
        let following = self
            .symbols
            .partition_point(|symbol| symbol.address <= address);
        if following == 0 {
            return Symbol::default();
        }
        let symbol = &self.symbols[following - 1];
        Symbol {
            name: symbol.name.clone(),
            module: KERNEL_MODULE.to_string(),
            start: symbol.address,
        }
    }
}

/// Proc table that resolves nothing; every user frame comes back unknown.
#[derive(Debug, Default)]
struct NullProcTable {
    pid: u32,
}

impl SymbolResolver for NullProcTable {
    fn resolve(&self, _address: u64) -> Symbol {
        Symbol::default()
    }
}

impl ProcTable for NullProcTable {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn error(&self) -> Option<&anyhow::Error> {
        None
    }
}

/// A [`SymbolCache`] backed only by `/proc/kallsyms`, loaded lazily on the
/// first kernel-stack walk. Process tables are always empty, so this suits
/// kernel-only profiling and the stand-alone binary.
#[derive(Default)]
pub struct KallsymsCache {
    kallsyms: Option<Kallsyms>,
    scratch: NullProcTable,
    round: u64,
}

impl SymbolCache for KallsymsCache {
    fn next_round(&mut self) {
        self.round += 1;
    }

    fn proc_table(&mut self, pid: u32) -> &dyn ProcTable {
        self.scratch.pid = pid;
        &self.scratch
    }

    fn kallsyms(&mut self) -> &dyn SymbolResolver {
        self.kallsyms.get_or_insert_with(|| match Kallsyms::load() {
            Ok(kallsyms) => kallsyms,
            Err(err) => {
                warn!("loading {KALLSYMS_PATH}: {err}");
                Kallsyms::default()
            }
        })
    }

    fn remove_dead_pid(&mut self, _pid: u32) {}

    fn cleanup(&mut self) {}

    fn update_options(&mut self, _options: &CacheOptions) {}

    fn stats(&self) -> CacheStats {
        CacheStats {
            proc_tables: 0,
            kernel_symbols: self.kallsyms.as_ref().map_or(0, Kallsyms::len),
            round: self.round,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &[u8] = b"0000000000000000 A fixed_percpu_data
ffffffff81000000 T _text
ffffffff810001a0 T secondary_startup
ffffffff81000400 t do_one_initcall
ffffffff810004f0 W arch_cpu_idle
ffffffff81000800 D vm_zone_stat
ffffffff81000900 r __param_str_debug
";

    #[test]
    fn accepted_symbol_kinds() {
        let kallsyms = Kallsyms::from_reader(Cursor::new(SAMPLE)).unwrap();
        // `A` and `r` entries are skipped.
        assert_eq!(kallsyms.len(), 5);
    }

    #[test]
    fn resolves_to_the_preceding_symbol() {
        let kallsyms = Kallsyms::from_reader(Cursor::new(SAMPLE)).unwrap();

        let sym = kallsyms.resolve(0xffffffff81000400);
        assert_eq!(sym.name, "do_one_initcall");
        assert_eq!(sym.module, "kernel");
        assert_eq!(sym.start, 0xffffffff81000400);

        // Between two symbols: the earlier one wins.
        let sym = kallsyms.resolve(0xffffffff810004ef);
        assert_eq!(sym.name, "do_one_initcall");

        // Past the last symbol: open-ended.
        let sym = kallsyms.resolve(0xffffffffa0000000);
        assert_eq!(sym.name, "vm_zone_stat");
    }

    #[test]
    fn addresses_before_the_table_are_unknown() {
        let kallsyms = Kallsyms::from_reader(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(kallsyms.resolve(0x1000), Symbol::default());
    }
}
