mod field_json;
mod simulation;

use field_json::JsonLayout;
use log::*;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Serialize;
use sfm_core::nalgebra::{Point2, Vector2, Vector3};
use sfm_core::{CameraIndex, FieldLayout, LandmarkId, LandmarkLayout, Pose3D, Timestamp};
use sfm_mapper::{MapEstimate, MapperSettings, SfmMapper};
use sfm_pinhole::{CameraIntrinsics, CameraModel, Distortion};
use simulation::Simulation;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

#[derive(StructOpt, Clone)]
#[structopt(
    name = "sfm-sandbox",
    about = "A tool for testing the landmark mapper on a simulated platform"
)]
struct Opt {
    /// The file where settings are specified.
    ///
    /// This is in the format of `sfm_mapper::MapperSettings`.
    #[structopt(short, long, default_value = "mapper-settings.json")]
    settings: PathBuf,
    /// A WPILib AprilTag field layout used as ground truth.
    ///
    /// Without one, landmarks are placed on a ring around the driven circle.
    #[structopt(short, long)]
    layout: Option<PathBuf>,
    /// Landmarks to hold fixed, in addition to those in the settings.
    ///
    /// If none are given anywhere, the first landmark of the layout is used.
    #[structopt(long)]
    anchor: Vec<i32>,
    /// Offset the mapper's layout guess of every free landmark by this many meters.
    #[structopt(long, default_value = "0.1")]
    layout_error: f64,
    /// The number of steps to simulate
    #[structopt(long, default_value = "200")]
    steps: usize,
    /// The radius of the driven circle in meters
    #[structopt(long, default_value = "2.0")]
    radius: f64,
    /// The number of steps per lap
    #[structopt(long, default_value = "100")]
    steps_per_lap: usize,
    /// The number of steps between keyframes
    #[structopt(long, default_value = "1")]
    keyframe_interval: usize,
    /// Uniform odometry noise per step, in meters and radians
    #[structopt(long, default_value = "0.005")]
    odometry_noise: f64,
    /// Uniform corner noise in pixels
    #[structopt(long, default_value = "0.5")]
    pixel_noise: f64,
    /// Seed of the noise generator
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// The focal length in pixels
    #[structopt(long, default_value = "600.0")]
    focal: f64,
    /// The image width in pixels
    #[structopt(long, default_value = "640")]
    width: u32,
    /// The image height in pixels
    #[structopt(long, default_value = "480")]
    height: u32,
    /// Output JSON file to deposit the final estimate
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Output WPILib JSON file to deposit the estimated layout
    #[structopt(long)]
    layout_output: Option<PathBuf>,
}

#[derive(Serialize)]
struct TruthPoint {
    timestamp: Timestamp,
    pose: Pose3D,
}

#[derive(Serialize)]
struct Output<'a> {
    estimate: &'a MapEstimate,
    truth: Vec<TruthPoint>,
    trajectory_rms_error: f64,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();

    let settings = std::fs::File::open(&opt.settings)
        .ok()
        .and_then(|file| serde_json::from_reader(file).ok());
    if settings.is_some() {
        info!("loaded existing settings");
    } else {
        info!("used default settings");
    }
    let mut settings: MapperSettings = settings.unwrap_or_default();

    let truth_layout = match &opt.layout {
        Some(path) => match load_layout(path) {
            Ok(layout) => layout,
            Err(e) => {
                error!("unable to load layout {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => simulation::ring_layout(12, opt.radius * 2.0, 0.5, 0.3),
    };
    if truth_layout.is_empty() {
        error!("the layout has no landmarks");
        std::process::exit(1);
    }

    settings
        .fixed_landmarks
        .extend(opt.anchor.iter().copied().map(LandmarkId));
    if settings.fixed_landmarks.is_empty() {
        if let Some((id, _)) = truth_layout.iter().next() {
            info!("anchoring landmark {}", id);
            settings.fixed_landmarks.push(id);
        }
    }

    let camera = CameraModel::new(CameraIntrinsics::identity().focal(opt.focal).principal_point(
        Point2::new(opt.width as f64 / 2.0, opt.height as f64 / 2.0),
    ))
    .with_distortion(Distortion::none())
    .with_robot_to_camera(Pose3D::from_translation_rpy(
        Vector3::new(0.0, 0.0, 0.5),
        0.0,
        0.0,
        0.0,
    ));
    let mut simulation = Simulation::new(
        truth_layout.clone(),
        camera,
        Vector2::new(opt.width as f64, opt.height as f64),
        opt.radius,
        2.0 * std::f64::consts::PI / opt.steps_per_lap as f64,
        opt.odometry_noise,
        opt.pixel_noise,
        Xoshiro256PlusPlus::seed_from_u64(opt.seed),
    );
    simulation.keyframe_interval = opt.keyframe_interval;
    settings.initial_pose = simulation.pose();

    let guess = perturbed_layout(&truth_layout, &settings.fixed_landmarks, opt.layout_error);
    let cameras: BTreeMap<CameraIndex, CameraModel> = [(CameraIndex(0), camera)].into_iter().collect();
    let mut mapper = SfmMapper::new(settings, guess, cameras);

    let mut truth = BTreeMap::new();
    for step in 0..opt.steps {
        let batch = simulation.step();
        for delta in &batch.odometry {
            truth.insert(delta.timestamp, simulation.pose());
        }
        match mapper.optimize(&batch) {
            Ok(output) => {
                for dropped in &output.report.dropped {
                    debug!("step {} dropped {:?}", step, dropped);
                }
                if let Some(pose) = output.estimate.latest_pose() {
                    let error = (pose.translation() - simulation.pose().translation()).norm();
                    info!(
                        "step {}: {} landmarks seen, position error {:.4} m",
                        step,
                        batch.keyframes.iter().map(|k| k.detections.len()).sum::<usize>(),
                        error
                    );
                }
            }
            Err(e) => warn!("step {} failed: {}", step, e),
        }
    }

    let estimate = mapper.estimate();
    let trajectory_rms_error = trajectory_rms_error(&estimate, &truth).unwrap_or(0.0);
    info!(
        "trajectory rms error {:.4} m over {} of {} steps",
        trajectory_rms_error,
        estimate.trajectory.len(),
        truth.len()
    );
    for (id, pose) in mapper.layout().iter() {
        if let Some(actual) = truth_layout.landmark_pose(id) {
            info!(
                "landmark {} error {:.4} m",
                id,
                (pose.translation() - actual.translation()).norm()
            );
        }
    }

    if let Some(path) = opt.output {
        info!("exporting the estimate");
        let output = Output {
            estimate: &estimate,
            truth: truth
                .into_iter()
                .map(|(timestamp, pose)| TruthPoint { timestamp, pose })
                .collect(),
            trajectory_rms_error,
        };
        if let Err(e) = save_json(&path, &output) {
            error!("unable to save estimate: {}", e);
        }
    }
    if let Some(path) = opt.layout_output {
        info!("exporting the layout");
        if let Err(e) = save_json(&path, &JsonLayout::from_layout(&mapper.layout())) {
            error!("unable to save layout: {}", e);
        }
    }
}

/// Root mean square position error of every estimated state against the true pose at its timestamp.
fn trajectory_rms_error(
    estimate: &MapEstimate,
    truth: &BTreeMap<Timestamp, Pose3D>,
) -> Option<f64> {
    let squared: Vec<f64> = estimate
        .trajectory
        .iter()
        .filter_map(|point| {
            let actual = truth.get(&point.timestamp)?;
            Some((point.pose.translation() - actual.translation()).norm_squared())
        })
        .collect();
    if squared.is_empty() {
        return None;
    }
    Some((squared.iter().sum::<f64>() / squared.len() as f64).sqrt())
}

fn load_layout(path: &Path) -> Result<FieldLayout, Box<dyn std::error::Error>> {
    let file = std::fs::File::open(path)?;
    let layout: JsonLayout = serde_json::from_reader(std::io::BufReader::new(file))?;
    Ok(layout.into_layout())
}

fn save_json(path: &Path, value: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    Ok(())
}

/// Shifts every free landmark sideways so the mapper has something to correct.
fn perturbed_layout(truth: &FieldLayout, anchors: &[LandmarkId], error: f64) -> FieldLayout {
    let mut guess = FieldLayout::new(truth.landmark_size);
    for (id, pose) in truth.iter() {
        let pose = if anchors.contains(&id) {
            pose
        } else {
            pose * Pose3D::from_translation_rpy(Vector3::new(0.0, error, 0.0), 0.0, 0.0, 0.0)
        };
        guess.insert(id, pose);
    }
    guess
}
