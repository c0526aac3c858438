use approx::assert_relative_eq;
use nalgebra::{DVector, Vector3};
use sextant::{error::Error, frame::wgs84_to_ecef, prelude::*};
use sguaba::systems::Wgs84;
use uom::ConstZero;
use uom::si::angle::degree;
use uom::si::f64::{Angle, Length};

fn kingston() -> Vector3<f64> {
    let position = Wgs84::builder()
        .latitude(Angle::new::<degree>(44.2187))
        .expect("latitude is between -90 and 90")
        .longitude(Angle::new::<degree>(-76.4747))
        .altitude(Length::ZERO)
        .build();
    wgs84_to_ecef(&position)
}

fn fix(t: f64, offset: Vector3<f64>) -> Measurement {
    let position = kingston() + offset;
    Measurement::from_std_devs(SensorKind::Gnss, t, position.as_slice(), &[1.0, 1.0, 1.0]).unwrap()
}

fn odometry(t: f64, speed: f64) -> Measurement {
    Measurement::from_std_devs(
        SensorKind::Odometry,
        t,
        &[speed, 0.0, 0.0, 0.0],
        &[0.05, 0.05, 0.05, 0.01],
    )
    .unwrap()
}

fn satellites() -> [Vector3<f64>; 5] {
    [
        Vector3::new(15_600_000.0, 7_540_000.0, 20_140_000.0),
        Vector3::new(18_760_000.0, 2_750_000.0, 18_610_000.0),
        Vector3::new(17_610_000.0, 14_630_000.0, 13_480_000.0),
        Vector3::new(19_170_000.0, 610_000.0, 18_390_000.0),
        Vector3::new(-5_000_000.0, -20_000_000.0, 16_000_000.0),
    ]
}

fn ranges(t: f64, clock: f64) -> impl Iterator<Item = Measurement> {
    let receiver = kingston();
    satellites().into_iter().map(move |satellite| {
        let range = (receiver - satellite).norm() + clock;
        Measurement::from_std_devs(SensorKind::Pseudorange, t, &[range], &[5.0])
            .unwrap()
            .with_aux(DVector::from_column_slice(satellite.as_slice()))
    })
}

fn odometry_only() -> FactorGraphConfig {
    let mut config = FactorGraphConfig::default();
    config.gnss.active = false;
    config.odometry.sensor.active = true;
    config
}

fn position_of(state: &sextant::state::StateVariable) -> Vector3<f64> {
    let mean = state.mean();
    Vector3::new(mean[0], mean[1], mean[2])
}

#[test]
fn three_fixes_end_to_end() {
    let fixes = [
        fix(0.0, Vector3::new(0.2, -0.1, 0.0)),
        fix(1.0, Vector3::new(-0.1, 0.3, 0.1)),
        fix(2.0, Vector3::new(0.0, 0.1, -0.2)),
    ];
    let set: MeasurementSet = fixes.iter().cloned().collect();
    let mut sink = MemorySink::new();

    let estimate = Estimator::new(FactorGraphConfig::default())
        .run(&set, &mut sink, &mut RunContext::default())
        .unwrap();

    assert_eq!(estimate.status, RunStatus::Completed);
    assert!(estimate.frame.is_some());

    let positions = sink.get(Artifact::Final, StateName::Position).unwrap();
    assert_eq!(positions.len(), 3);
    assert!(positions.windows(2).all(|w| w[0].timestamp() < w[1].timestamp()));
    for (state, fix) in positions.iter().zip(&fixes) {
        let input = Vector3::new(fix.mean()[0], fix.mean()[1], fix.mean()[2]);
        let error = (position_of(state) - input).norm();
        assert!(error < 1.0, "estimate at t={} is {error} m off", state.timestamp());
    }

    let last = estimate.summaries.last().unwrap();
    assert_eq!(last.timestamp, 2.0);
    assert_eq!(last.solve.mode, SolveMode::Full);
    assert_eq!(sink.summaries.len(), 3);
}

#[test]
fn local_positions_are_written_before_conversion() {
    let set: MeasurementSet = [fix(0.0, Vector3::zeros()), fix(1.0, Vector3::new(3.0, 0.0, 0.0))]
        .into_iter()
        .collect();
    let mut sink = MemorySink::new();
    let estimate = Estimator::new(FactorGraphConfig::default())
        .run(&set, &mut sink, &mut RunContext::default())
        .unwrap();

    let local = sink.get(Artifact::LocalFrame, StateName::Position).unwrap();
    let global = sink.get(Artifact::Final, StateName::Position).unwrap();
    assert_eq!(local.len(), global.len());
    // The tangent plane is anchored on the first fix.
    assert!(position_of(&local[0]).norm() < 1.0);
    assert!(position_of(&global[0]).norm() > 6.0e6);

    let frame = estimate.frame.unwrap();
    for (local, global) in local.iter().zip(global) {
        let converted = frame.to_global(&position_of(local));
        assert_relative_eq!(converted, position_of(global), epsilon = 1e-6);
    }
    // Local-frame data precedes the final trajectory.
    assert_eq!(sink.written[0].0, Artifact::LocalFrame);
}

#[test]
fn single_measurement_runs_once() {
    let set: MeasurementSet = [fix(5.0, Vector3::zeros())].into_iter().collect();
    let mut sink = MemorySink::new();
    let estimate = Estimator::new(FactorGraphConfig::default())
        .run(&set, &mut sink, &mut RunContext::default())
        .unwrap();

    assert_eq!(estimate.summaries.len(), 1);
    assert_eq!(estimate.summaries[0].solve.mode, SolveMode::Full);
    for (_, _, states) in &sink.written {
        assert_eq!(states.len(), 1);
    }
}

#[test]
fn empty_source_aborts_without_output() {
    let mut sink = MemorySink::new();
    let result = Estimator::new(FactorGraphConfig::default()).run(
        &MeasurementSet::new(),
        &mut sink,
        &mut RunContext::default(),
    );
    assert!(matches!(result, Err(Error::EmptySource)));
    assert!(sink.written.is_empty());
}

#[test]
fn inactive_data_has_no_timestamp() {
    let set: MeasurementSet = [odometry(0.0, 1.0)].into_iter().collect();
    let mut sink = MemorySink::new();
    let result = Estimator::new(FactorGraphConfig::default()).run(
        &set,
        &mut sink,
        &mut RunContext::default(),
    );
    assert!(matches!(result, Err(Error::NoTimestamp(_))));
    assert!(sink.written.is_empty());
}

#[test]
fn unanchored_run_stays_in_native_frame() {
    let set: MeasurementSet = (0..=10).map(|i| odometry(i as f64 / 5.0, 2.0)).collect();
    let mut sink = MemorySink::new();
    let estimate = Estimator::new(odometry_only())
        .run(&set, &mut sink, &mut RunContext::default())
        .unwrap();

    assert!(estimate.frame.is_none());
    assert!(sink.get(Artifact::LocalFrame, StateName::Position).is_none());
    let positions = sink.get(Artifact::Final, StateName::Position).unwrap();
    assert_eq!(positions.len(), 11);
    assert_relative_eq!(position_of(&positions[10]).x, 4.0, epsilon = 0.1);
    for (written, kept) in positions.iter().zip(estimate.trajectory.states(StateName::Position)) {
        assert_eq!(written.mean(), kept.mean());
    }
}

#[test]
fn window_freezes_old_states() {
    let mut config = odometry_only();
    config.window = Some(1.0);
    let set: MeasurementSet = (0..=20).map(|i| odometry(i as f64 / 4.0, 1.0)).collect();
    let estimate = Estimator::new(config)
        .run(&set, &mut MemorySink::new(), &mut RunContext::default())
        .unwrap();

    let frozen: Vec<usize> = estimate.summaries.iter().map(|s| s.frozen_states).collect();
    assert!(frozen.windows(2).all(|w| w[0] <= w[1]));
    assert!(*frozen.last().unwrap() > 0);
    // Only the last second of states stays free.
    assert!(estimate.summaries.last().unwrap().free_states <= 2 * 5);
}

#[test]
fn cancellation_keeps_completed_steps() {
    let set: MeasurementSet = (0..=10).map(|i| odometry(i as f64, 1.0)).collect();
    let flag = CancelFlag::new();
    flag.cancel();
    let mut sink = MemorySink::new();
    let estimate = Estimator::new(odometry_only())
        .run(&set, &mut sink, &mut RunContext::default().with_cancel(flag))
        .unwrap();

    assert_eq!(estimate.status, RunStatus::Cancelled);
    assert_eq!(estimate.summaries.len(), 1);
    assert_eq!(sink.get(Artifact::Final, StateName::Position).unwrap().len(), 1);
}

#[test]
fn progress_is_monotone_and_completes() {
    let set: MeasurementSet = (0..=4).map(|i| odometry(i as f64, 1.0)).collect();
    let mut seen = Vec::new();
    {
        let mut ctx = RunContext::default().with_progress(|fraction| seen.push(fraction));
        Estimator::new(odometry_only())
            .run(&set, &mut MemorySink::new(), &mut ctx)
            .unwrap();
    }
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*seen.last().unwrap(), 1.0);
}

#[test]
fn stationary_imu_with_gnss_stays_put() {
    let mut config = FactorGraphConfig::default();
    config.imu.sensor.active = true;
    let imu = (0..=30).map(|i| {
        Measurement::from_std_devs(
            SensorKind::Imu,
            i as f64 / 10.0,
            &[0.0, 0.0, 9.81, 0.0, 0.0, 0.0],
            &[0.05; 6],
        )
        .unwrap()
    });
    let gnss = (0..=3).map(|i| fix(i as f64, Vector3::zeros()));
    let set: MeasurementSet = imu.chain(gnss).collect();

    let mut sink = MemorySink::new();
    let estimate = Estimator::new(config)
        .run(&set, &mut sink, &mut RunContext::default())
        .unwrap();

    assert_eq!(estimate.summaries.len(), 31);
    let local = sink.get(Artifact::LocalFrame, StateName::Position).unwrap();
    assert!(local.iter().all(|state| position_of(state).norm() < 0.5));
    let velocities = sink.get(Artifact::Final, StateName::Velocity).unwrap();
    assert!(velocities.iter().all(|state| position_of(state).norm() < 0.1));
}

#[test]
fn pseudoranges_alone_recover_position_and_clock() {
    let mut config = FactorGraphConfig::default();
    config.gnss.active = false;
    config.pseudorange.active = true;
    let clock = |t: f64| 300.0 + 20.0 * t;
    let set: MeasurementSet = (0..3)
        .flat_map(|i| ranges(i as f64, clock(i as f64)))
        .collect();

    let mut sink = MemorySink::new();
    let estimate = Estimator::new(config)
        .run(&set, &mut sink, &mut RunContext::default())
        .unwrap();

    assert_eq!(estimate.status, RunStatus::Completed);
    assert!(estimate.frame.is_some());
    assert_eq!(estimate.summaries.len(), 3);

    let positions = sink.get(Artifact::Final, StateName::Position).unwrap();
    assert_eq!(positions.len(), 3);
    for state in positions {
        let error = (position_of(state) - kingston()).norm();
        assert!(error < 1.0, "receiver at t={} is {error} m off", state.timestamp());
    }

    let clocks = sink.get(Artifact::Final, StateName::ClockBias).unwrap();
    assert_eq!(clocks.len(), 3);
    for state in clocks {
        assert_relative_eq!(state.mean()[0], clock(state.timestamp()), epsilon = 1.0);
    }
}

#[test]
fn position_prior_pulls_first_height() {
    let set: MeasurementSet = (0..3).map(|i| fix(i as f64, Vector3::zeros())).collect();
    let first_height = |config: FactorGraphConfig| {
        let mut sink = MemorySink::new();
        Estimator::new(config)
            .run(&set, &mut sink, &mut RunContext::default())
            .unwrap();
        let local = sink.get(Artifact::LocalFrame, StateName::Position).unwrap();
        assert_eq!(local[0].timestamp(), 0.0);
        local[0].mean()[2]
    };

    let free = first_height(FactorGraphConfig::default());
    assert!(free.abs() < 0.1, "height without prior is {free}");

    let mut config = FactorGraphConfig::default();
    config.prior.active = true;
    config.prior.height = 5.0;
    config.prior.sqrt_information = [1.0, 1.0, 100.0];
    let held = first_height(config);
    assert_relative_eq!(held, 5.0, epsilon = 0.01);
}
