use sextant::{
    io::{FileSink, read_measurements, read_measurements_file},
    prelude::*,
};
use chrono::DateTime;
use std::{fs, path::PathBuf};

const DRIVE: &str = "\
# kind t mean std
gnss 0.0 1130000.0 -4720000.0 4420000.0 1.0 1.0 1.0
odometry 0.5 1.0 0.0 0.0 0.0 0.1 0.1 0.1 0.01
gnss 1.0 1130000.5 -4720000.0 4420000.0 1.0 1.0 1.0
gnss 2.0 1130001.0 -4720000.0 4420000.0 1.0 1.0 1.0
";

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("sextant-{}-{name}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn file_run_writes_every_artifact() {
    let dir = scratch("run");
    let input = dir.join("drive.txt");
    let output = dir.join("trajectory.txt");
    fs::write(&input, DRIVE).unwrap();

    let measurements = read_measurements_file(&input).unwrap();
    assert_eq!(measurements.len(), 4);

    let mut sink = FileSink::new(&output);
    let estimate = Estimator::new(FactorGraphConfig::default())
        .run(&measurements, &mut sink, &mut RunContext::default())
        .unwrap();
    sink.finish().unwrap();
    assert_eq!(estimate.summaries.len(), 3);

    let trajectory = fs::read_to_string(&output).unwrap();
    let lines: Vec<&str> = trajectory.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(lines.len(), 3);
    assert!(lines.iter().all(|l| l.starts_with("position ")));

    let local = fs::read_to_string(dir.join("trajectory.txt_local")).unwrap();
    assert_eq!(local.lines().filter(|l| !l.starts_with('#')).count(), 3);

    let summary = fs::read_to_string(dir.join("trajectory.txt_summary")).unwrap();
    for text in [&trajectory, &local, &summary] {
        let header = text.lines().next().unwrap();
        let created = header.rsplit(", ").next().unwrap();
        assert!(header.starts_with("# sextant "), "{header}");
        assert!(DateTime::parse_from_rfc3339(created).is_ok(), "{header}");
    }
    let last = summary.lines().last().unwrap();
    assert!(last.starts_with("2 2.000000 Full"), "{last}");

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn reader_accepts_windows_line_endings() {
    let input = DRIVE.replace('\n', "\r\n");
    let set = read_measurements(input.as_bytes()).unwrap();
    assert_eq!(set.stream(SensorKind::Gnss).len(), 3);
    assert_eq!(set.stream(SensorKind::Odometry).len(), 1);
}
