pub mod diagnostic; // Per-call audit dump (opt-in via PipelineOptions::dump_dir)
pub mod evidence;
