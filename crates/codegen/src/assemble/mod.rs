//! The assembly passes: mangling, fragment formation, register scheduling,
//! flag save/restore and final emission.

pub mod emit;
pub mod flags;
pub mod fragment;
pub mod liveness;
pub mod mangle;
pub mod schedule;

use granary_x64::{CachePc, EncodeError, GPR_WIDTH_BYTES};

use crate::cfg::Trace;

/// A trace run through every assembly pass, ready to measure and commit.
#[derive(Debug)]
pub struct Compiled {
    /// The scheduled fragment graph.
    pub graph: fragment::FragmentGraph,
}

impl Compiled {
    /// Encoded size in bytes, computed without writing anything.
    pub fn staged_size(&self) -> Result<usize, EncodeError> {
        emit::staged_size(&self.graph)
    }

    /// Commit the trace at cache PC `base`.
    pub fn commit(&self, base: CachePc) -> Result<emit::EmittedTrace, EncodeError> {
        emit::emit(&self.graph, base)
    }
}

/// Run the assembly passes over a materialised (and, if a client is
/// attached, instrumented) trace: mangle, cut into fragments, analyse
/// liveness, restore liveness invariants with compensation fragments, wrap
/// flag zones, schedule registers.
pub fn assemble(trace: &mut Trace) -> Compiled {
    mangle::mangle_trace(trace);
    let mut graph = fragment::FragmentGraph::build(trace);
    liveness::analyse(&mut graph);
    graph.insert_compensation();
    flags::build_zones(&mut graph, &mut |block| {
        trace.block_mut(block).alloc_virtual_register(GPR_WIDTH_BYTES)
    });
    schedule::schedule(&mut graph);
    Compiled { graph }
}
