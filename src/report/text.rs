use super::{source::SourceCache, Summary};
use crate::aggregate::{Entry, Location, Metric, Store};
use std::io::Write;

/// Render one report block per source location, with the source excerpt
/// below the location if the file can be read.
fn write_location(
    out: &mut impl Write,
    sources: &mut SourceCache,
    location: &Location<'_>,
) -> std::io::Result<()> {
    writeln!(out, "{location}")?;
    if let Some(excerpt) = sources.excerpt(location.file, location.line, location.column) {
        write!(out, "{excerpt}")?;
    }
    Ok(())
}

fn write_section<M, F>(
    out: &mut impl Write,
    sources: &mut SourceCache,
    store: &Store<M>,
    verbose: bool,
    mut write_entry: F,
) -> std::io::Result<bool>
where
    M: Metric,
    F: FnMut(&mut dyn Write, &Entry<M>) -> std::io::Result<()>,
{
    let mut found = false;
    for (location, entry) in store.reportable(verbose) {
        found = true;
        write_location(out, sources, &location)?;
        write_entry(out, entry)?;
    }
    Ok(found)
}

pub fn write_cache_line_use(
    out: &mut impl Write,
    sources: &mut SourceCache,
    summary: &Summary<'_>,
) -> std::io::Result<()> {
    writeln!(out, "\n=== L2 cache line use report ======================")?;
    let found = write_section(
        out,
        sources,
        summary.global_accesses,
        summary.verbose,
        |out, entry| {
            writeln!(
                out,
                "\t{} of {} bytes at IR level ({} bytes at ISA level: \"{}\")",
                entry.direction, entry.ir_access_size, entry.isa_access_size, entry.isa_instruction
            )?;
            writeln!(
                out,
                "\texecuted {} times, {} cache lines needed, {} cache lines used",
                entry.count, entry.metric.needed, entry.metric.used
            )
        },
    )?;
    if !found {
        writeln!(out, "No excess cache lines used for global memory accesses")?;
    }
    writeln!(out, "=== End of L2 cache line use report ===============")
}

pub fn write_bank_conflicts(
    out: &mut impl Write,
    sources: &mut SourceCache,
    summary: &Summary<'_>,
) -> std::io::Result<()> {
    writeln!(out, "\n=== Bank conflicts report =========================")?;
    let found = write_section(
        out,
        sources,
        summary.lds_accesses,
        summary.verbose,
        |out, entry| {
            writeln!(
                out,
                "\t{} of {} bytes at IR level",
                entry.direction, entry.ir_access_size
            )?;
            writeln!(
                out,
                "\texecuted {} times, {} bank conflicts in total",
                entry.count, entry.metric.0
            )
        },
    )?;
    if !found {
        writeln!(out, "No bank conflicts found")?;
    }
    writeln!(out, "=== End of bank conflicts report ====================")
}

/// Both text reports, preceded by the kernel identity in verbose mode.
pub fn write(
    out: &mut impl Write,
    sources: &mut SourceCache,
    summary: &Summary<'_>,
) -> std::io::Result<()> {
    if summary.verbose {
        writeln!(
            out,
            "Memory analysis for {} dispatch_id[{}]",
            summary.kernel.name, summary.kernel.dispatch_id
        )?;
    }
    write_cache_line_use(out, sources, summary)?;
    write_bank_conflicts(out, sources, summary)?;
    Ok(())
}
