//! Outlining analyses: the corrected post-dominator tree (§4.7), the
//! program-dependence graph that drives outlining legality (§4.8), and the
//! global-reference walker (§4.12).

pub mod cfg;
pub mod dominators;
pub mod globals;
pub mod pdg;

pub use cfg::{BlockCfg, CfgNode, CorrectedPostDominators};
pub use dominators::DominatorTree;
pub use pdg::{Externals, ProgramDependenceGraph};
