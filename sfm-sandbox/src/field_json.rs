//! Reading and writing landmark layouts in the WPILib AprilTag field layout JSON format.

use serde::{Deserialize, Serialize};
use sfm_core::nalgebra::{Quaternion, UnitQuaternion, Vector3};
use sfm_core::{FieldLayout, LandmarkId, Pose3D, DEFAULT_LANDMARK_SIZE};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonTranslation {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
struct JsonQuaternion {
    w: f64,
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonRotation {
    quaternion: JsonQuaternion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonPose {
    translation: JsonTranslation,
    rotation: JsonRotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonTag {
    #[serde(rename = "ID")]
    id: i32,
    pose: JsonPose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonField {
    length: f64,
    width: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLayout {
    tags: Vec<JsonTag>,
    #[serde(default = "default_field")]
    field: JsonField,
}

fn default_field() -> JsonField {
    JsonField {
        length: 0.0,
        width: 0.0,
    }
}

impl JsonLayout {
    pub fn into_layout(self) -> FieldLayout {
        let mut layout = FieldLayout::new(DEFAULT_LANDMARK_SIZE);
        for tag in self.tags {
            let JsonTranslation { x, y, z } = tag.pose.translation;
            let JsonQuaternion { w, x: i, y: j, z: k } = tag.pose.rotation.quaternion;
            let rotation = UnitQuaternion::from_quaternion(Quaternion::new(w, i, j, k));
            layout.insert(
                tag.id,
                Pose3D::from_parts(Vector3::new(x, y, z), rotation.to_rotation_matrix()),
            );
        }
        layout
    }

    pub fn from_layout(layout: &FieldLayout) -> Self {
        let tags = layout
            .iter()
            .map(|(LandmarkId(id), pose)| {
                let translation = pose.translation();
                let quaternion = UnitQuaternion::from_rotation_matrix(&pose.rotation());
                JsonTag {
                    id,
                    pose: JsonPose {
                        translation: JsonTranslation {
                            x: translation.x,
                            y: translation.y,
                            z: translation.z,
                        },
                        rotation: JsonRotation {
                            quaternion: JsonQuaternion {
                                w: quaternion.w,
                                x: quaternion.i,
                                y: quaternion.j,
                                z: quaternion.k,
                            },
                        },
                    },
                }
            })
            .collect();
        Self {
            tags,
            field: default_field(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_TAGS: &str = r#"{
        "tags": [
            {
                "ID": 1,
                "pose": {
                    "translation": { "x": 15.0, "y": 1.0, "z": 0.5 },
                    "rotation": { "quaternion": { "W": 0.0, "X": 0.0, "Y": 0.0, "Z": 1.0 } }
                }
            },
            {
                "ID": 7,
                "pose": {
                    "translation": { "x": 1.0, "y": 4.0, "z": 0.5 },
                    "rotation": { "quaternion": { "W": 1.0, "X": 0.0, "Y": 0.0, "Z": 0.0 } }
                }
            }
        ],
        "field": { "length": 16.54, "width": 8.21 }
    }"#;

    #[test]
    fn reads_wpilib_layout() {
        let layout = serde_json::from_str::<JsonLayout>(TWO_TAGS)
            .unwrap()
            .into_layout();
        assert_eq!(layout.len(), 2);
        let facing_back = layout.landmarks[&LandmarkId(1)];
        assert_eq!(facing_back.translation(), Vector3::new(15.0, 1.0, 0.5));
        let normal = facing_back.rotation() * Vector3::x();
        assert!((normal - Vector3::new(-1.0, 0.0, 0.0)).norm() < 1e-12);
        assert_eq!(
            layout.landmarks[&LandmarkId(7)].rotation(),
            Pose3D::identity().rotation()
        );
    }

    #[test]
    fn written_layout_reads_back() {
        let layout = serde_json::from_str::<JsonLayout>(TWO_TAGS)
            .unwrap()
            .into_layout();
        let text = serde_json::to_string(&JsonLayout::from_layout(&layout)).unwrap();
        let again = serde_json::from_str::<JsonLayout>(&text)
            .unwrap()
            .into_layout();
        for ((a, pa), (b, pb)) in layout.iter().zip(again.iter()) {
            assert_eq!(a, b);
            assert!((pa.translation() - pb.translation()).norm() < 1e-12);
            assert!(pa.rotation().angle_to(&pb.rotation()) < 1e-9);
        }
    }
}
