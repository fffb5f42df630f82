use pbalign::stats::AlignmentStats;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn get_pbalign_binary() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_pbalign") {
        return PathBuf::from(path);
    }
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let release = manifest_dir.join("target/release/pbalign");
    if release.exists() {
        return release;
    }
    manifest_dir.join("target/debug/pbalign")
}

/// Stand-in aligner reporting every read unmapped, reading @SQ lines from the
/// reference index the pipeline creates next to the FASTA
const UNMAPPED_ALIGNER: &str = r#"#!/bin/sh
reads="$1"; ref="$2"; out="$3"
awk 'BEGIN{OFS="\t"} {print "@SQ", "SN:"$1, "LN:"$2}' "$ref.fai" > "$out"
awk 'BEGIN{OFS="\t"} /^>/ {print substr($1,2), 4, "*", 0, 0, "*", "*", 0, 0, "*", "*"}' "$reads" >> "$out"
"#;

const FAILING_ALIGNER: &str = "#!/bin/sh\necho 'blasr: out of memory' >&2\nexit 3\n";

fn write_inputs(dir: &Path) -> std::io::Result<()> {
    std::fs::write(
        dir.join("reference.fasta"),
        ">chr1\nACGTACGTACGTACGTACGTACGTACGTACGTACGTACGT\n>chr2\nTTTTGGGGCCCCAAAA\n",
    )?;
    let mut reads = String::new();
    for hole in [5, 17, 2000, 30001, 30002] {
        reads.push_str(&format!(">movieA/{}/0_12\nACGTTGCAACGT\n", hole));
    }
    std::fs::write(dir.join("reads.fasta"), reads)?;
    std::fs::write(dir.join("unmapped.sh"), UNMAPPED_ALIGNER)?;
    std::fs::write(dir.join("failing.sh"), FAILING_ALIGNER)?;
    Ok(())
}

fn template(dir: &Path, script: &str) -> String {
    format!("sh {} {{reads}} {{reference}} {{output}}", dir.join(script).display())
}

#[test]
fn test_cli_aligns_and_indexes() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path();
    write_inputs(dir)?;

    let output = Command::new(get_pbalign_binary())
        .current_dir(dir)
        .args([
            "reads.fasta",
            "reference.fasta",
            "out.bam",
            "--alignerCommand",
            &template(dir, "unmapped.sh"),
            "--holeNumbers",
            "1-20,30000-30001",
            "--maxChunkSize",
            "2",
            "-j",
            "2",
            "-v",
            "1",
        ])
        .output()?;
    assert!(
        output.status.success(),
        "pbalign failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let bam = dir.join("out.bam");
    assert!(bam.exists());
    assert!(dir.join("out.bam.bai").exists());
    let stats = AlignmentStats::from_file(&bam).unwrap();
    assert_eq!(stats.records, 3);
    assert_eq!(stats.unmapped, 3);
    assert_eq!(
        stats.mapped_per_reference,
        vec![("chr1".to_string(), 0), ("chr2".to_string(), 0)]
    );
    Ok(())
}

#[test]
fn test_cli_aligner_failure_publishes_nothing() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path();
    write_inputs(dir)?;

    let output = Command::new(get_pbalign_binary())
        .current_dir(dir)
        .args([
            "reads.fasta",
            "reference.fasta",
            "out.bam",
            "--alignerCommand",
            &template(dir, "failing.sh"),
        ])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("alignment failed"), "stderr: {}", stderr);
    assert!(stderr.contains("out of memory"), "stderr: {}", stderr);
    assert!(!dir.join("out.bam").exists());
    assert!(!dir.join("out.bam.bai").exists());
    Ok(())
}

#[test]
fn test_cli_rejects_empty_subset_and_bad_arguments() -> std::io::Result<()> {
    let temp_dir = TempDir::new()?;
    let dir = temp_dir.path();
    write_inputs(dir)?;

    let empty = Command::new(get_pbalign_binary())
        .current_dir(dir)
        .args([
            "reads.fasta",
            "reference.fasta",
            "out.bam",
            "--alignerCommand",
            &template(dir, "unmapped.sh"),
            "--holeNumbers",
            "900000-900010",
        ])
        .output()?;
    assert!(!empty.status.success());
    assert!(String::from_utf8_lossy(&empty.stderr).contains("dataset resolution failed"));
    assert!(!dir.join("out.bam").exists());

    let bad_range = Command::new(get_pbalign_binary())
        .current_dir(dir)
        .args(["reads.fasta", "reference.fasta", "out.bam", "--holeNumbers", "20-10"])
        .output()?;
    assert!(!bad_range.status.success());

    let bad_template = Command::new(get_pbalign_binary())
        .current_dir(dir)
        .args([
            "reads.fasta",
            "reference.fasta",
            "out.bam",
            "--alignerCommand",
            "blasr {reads}",
        ])
        .output()?;
    assert!(!bad_template.status.success());
    assert!(String::from_utf8_lossy(&bad_template.stderr).contains("configuration failed"));
    Ok(())
}
