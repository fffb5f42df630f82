// lib.rs
pub mod aligner;
pub mod alignment_record;
pub mod bam_input;
pub mod chunk;
pub mod dataset;
pub mod error;
pub mod index;
pub mod merge;
pub mod pipeline;
pub mod read_set;
pub mod realign;
pub mod reference;
pub mod sorted_run;
pub mod stats;
pub mod subset_filter;
pub mod supervisor;
pub mod writer;
