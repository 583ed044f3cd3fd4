//! Avatar movement and hit geometry

use glam::{Quat, Vec2, Vec3};

use super::combat::BodyPart;
use super::components::Collider;

/// Ground plane height
pub const GROUND_HEIGHT: f32 = 0.0;
/// Downward acceleration in units/s²
pub const GRAVITY: f32 = 9.81;
/// Vertical speed given by a jump
pub const JUMP_SPEED: f32 = 4.5;
/// Speed multiplier while crouched
pub const CROUCH_SPEED_FACTOR: f32 = 0.5;
/// Eye height above the feet, used as the muzzle origin
pub const EYE_HEIGHT: f32 = 1.6;

/// Result of a ray or sweep hitting a collider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapsuleHit {
    /// Distance along the ray
    pub distance: f32,
    pub point: Vec3,
    pub body_part: BodyPart,
}

/// Stateless movement and collision helpers
pub struct PhysicsSystem;

impl PhysicsSystem {
    /// Horizontal velocity for a stick deflection relative to a facing.
    /// `movement.y` is forward, `movement.x` strafes right.
    pub fn planar_velocity(rotation: Quat, movement: Vec2, speed: f32) -> Vec3 {
        let forward = flatten(rotation * Vec3::NEG_Z);
        let right = flatten(rotation * Vec3::X);

        // Clamp diagonal input so it is not faster than straight input
        let stick = movement.clamp_length_max(1.0);
        (right * stick.x + forward * stick.y) * speed
    }

    pub fn on_ground(position: Vec3) -> bool {
        position.y <= GROUND_HEIGHT + 1e-3
    }

    /// Integrate one step with gravity, clamping to the ground plane.
    /// Returns the new position and velocity.
    pub fn integrate(position: Vec3, velocity: Vec3, delta_time: f32) -> (Vec3, Vec3) {
        let mut velocity = velocity;
        if !Self::on_ground(position) || velocity.y > 0.0 {
            velocity.y -= GRAVITY * delta_time;
        }

        let mut position = position + velocity * delta_time;
        if position.y < GROUND_HEIGHT {
            position.y = GROUND_HEIGHT;
            velocity.y = velocity.y.max(0.0);
        }
        (position, velocity)
    }

    /// Yaw-only rotation that faces from `from` toward `to`
    pub fn look_rotation(from: Vec3, to: Vec3) -> Option<Quat> {
        let dir = flatten(to - from);
        if dir == Vec3::ZERO {
            return None;
        }
        Some(Quat::from_rotation_y(f32::atan2(-dir.x, -dir.z)))
    }

    /// Cast a ray against a vertical capsule standing on `feet`.
    ///
    /// The capsule is treated as a cylinder for entry; the body part comes from
    /// the entry height and how close the ray passes to the center line.
    pub fn ray_capsule(origin: Vec3, direction: Vec3, max_distance: f32, feet: Vec3, collider: &Collider) -> Option<CapsuleHit> {
        let dir = direction.normalize_or_zero();
        if dir == Vec3::ZERO || collider.radius <= 0.0 || collider.height <= 0.0 {
            return None;
        }

        let rel = Vec2::new(origin.x - feet.x, origin.z - feet.z);
        let d = Vec2::new(dir.x, dir.z);
        let a = d.length_squared();
        let r2 = collider.radius * collider.radius;

        let (t_enter, lateral) = if a < 1e-8 {
            // Straight up/down: hit only when already inside the circle
            if rel.length_squared() > r2 {
                return None;
            }
            let top = feet.y + collider.height;
            let t = if dir.y < 0.0 { origin.y - top } else { feet.y - origin.y };
            (t.max(0.0), rel.length() / collider.radius)
        } else {
            let b = 2.0 * rel.dot(d);
            let c = rel.length_squared() - r2;
            let disc = b * b - 4.0 * a * c;
            if disc < 0.0 {
                return None;
            }
            let sqrt = disc.sqrt();
            let t0 = (-b - sqrt) / (2.0 * a);
            let t1 = (-b + sqrt) / (2.0 * a);
            if t1 < 0.0 {
                return None;
            }

            // Closest pass to the center line
            let perp = rel.perp_dot(d).abs() / a.sqrt();
            let t = t0.max(0.0);

            // Entry point may be above or below the capsule; step to the cap
            let y = origin.y + dir.y * t;
            let t = if y > feet.y + collider.height && dir.y < 0.0 {
                (feet.y + collider.height - origin.y) / dir.y
            } else if y < feet.y && dir.y > 0.0 {
                (feet.y - origin.y) / dir.y
            } else {
                t
            };
            if t > t1 {
                return None;
            }
            (t, perp / collider.radius)
        };

        if t_enter > max_distance {
            return None;
        }
        let point = origin + dir * t_enter;
        let height = point.y - feet.y;
        if !(-1e-3..=collider.height + 1e-3).contains(&height) {
            return None;
        }

        Some(CapsuleHit {
            distance: t_enter,
            point,
            body_part: BodyPart::from_impact(height / collider.height, lateral),
        })
    }

    /// Whether a sphere at `point` overlaps a capsule standing on `feet`.
    /// Sphere impacts are classified by height alone.
    pub fn sphere_capsule(point: Vec3, radius: f32, feet: Vec3, collider: &Collider) -> Option<BodyPart> {
        let axis_y = point.y.clamp(feet.y, feet.y + collider.height);
        let axis = Vec3::new(feet.x, axis_y, feet.z);
        let reach = collider.radius + radius;
        if point.distance_squared(axis) > reach * reach {
            return None;
        }

        let height = ((axis_y - feet.y) / collider.height).clamp(0.0, 1.0);
        Some(BodyPart::from_impact(height, 0.0))
    }
}

fn flatten(v: Vec3) -> Vec3 {
    Vec3::new(v.x, 0.0, v.z).normalize_or_zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_stick_moves_along_facing() {
        let v = PhysicsSystem::planar_velocity(Quat::IDENTITY, Vec2::new(0.0, 1.0), 5.0);
        assert!((v - Vec3::new(0.0, 0.0, -5.0)).length() < 1e-5);

        let yawed = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);
        let v = PhysicsSystem::planar_velocity(yawed, Vec2::new(0.0, 1.0), 5.0);
        assert!((v - Vec3::new(-5.0, 0.0, 0.0)).length() < 1e-4);
    }

    #[test]
    fn diagonal_is_not_faster() {
        let v = PhysicsSystem::planar_velocity(Quat::IDENTITY, Vec2::new(1.0, 1.0), 5.0);
        assert!(v.length() <= 5.0 + 1e-4);
    }

    #[test]
    fn gravity_returns_to_ground() {
        let (mut pos, mut vel) = (Vec3::ZERO, Vec3::new(0.0, JUMP_SPEED, 0.0));
        let mut peak: f32 = 0.0;
        for _ in 0..120 {
            (pos, vel) = PhysicsSystem::integrate(pos, vel, 1.0 / 60.0);
            peak = peak.max(pos.y);
        }
        assert!(peak > 0.5);
        assert_eq!(pos.y, GROUND_HEIGHT);
        assert_eq!(vel.y, 0.0);
    }

    #[test]
    fn look_rotation_faces_target() {
        let rot = PhysicsSystem::look_rotation(Vec3::ZERO, Vec3::new(10.0, 0.0, 0.0)).expect("rotation");
        assert!((rot * Vec3::NEG_Z - Vec3::X).length() < 1e-5);
        assert!(PhysicsSystem::look_rotation(Vec3::ONE, Vec3::ONE).is_none());
    }

    #[test]
    fn ray_hits_chest_and_head() {
        let collider = Collider::default();
        let feet = Vec3::new(0.0, 0.0, -10.0);

        let chest = PhysicsSystem::ray_capsule(Vec3::new(0.0, 1.3, 0.0), Vec3::NEG_Z, 100.0, feet, &collider)
            .expect("chest hit");
        assert_eq!(chest.body_part, BodyPart::Chest);
        assert!((chest.distance - 9.6).abs() < 1e-3);

        let head = PhysicsSystem::ray_capsule(Vec3::new(0.0, 1.7, 0.0), Vec3::NEG_Z, 100.0, feet, &collider)
            .expect("head hit");
        assert_eq!(head.body_part, BodyPart::Head);
    }

    #[test]
    fn ray_misses_outside_range_or_radius() {
        let collider = Collider::default();
        let feet = Vec3::new(0.0, 0.0, -10.0);
        let origin = Vec3::new(0.0, 1.3, 0.0);

        assert!(PhysicsSystem::ray_capsule(origin, Vec3::NEG_Z, 5.0, feet, &collider).is_none());
        assert!(PhysicsSystem::ray_capsule(Vec3::new(1.0, 1.3, 0.0), Vec3::NEG_Z, 100.0, feet, &collider).is_none());
        assert!(PhysicsSystem::ray_capsule(origin, Vec3::Z, 100.0, feet, &collider).is_none());
        assert!(PhysicsSystem::ray_capsule(Vec3::new(0.0, 2.5, 0.0), Vec3::NEG_Z, 100.0, feet, &collider).is_none());
    }

    #[test]
    fn grazing_ray_hits_arm() {
        let collider = Collider::default();
        let feet = Vec3::new(0.0, 0.0, -10.0);
        let hit = PhysicsSystem::ray_capsule(Vec3::new(0.35, 1.2, 0.0), Vec3::NEG_Z, 100.0, feet, &collider)
            .expect("graze");
        assert_eq!(hit.body_part, BodyPart::Arm);
    }

    #[test]
    fn sphere_overlap() {
        let collider = Collider::default();
        assert!(PhysicsSystem::sphere_capsule(Vec3::new(0.5, 1.0, 0.0), 0.3, Vec3::ZERO, &collider).is_some());
        assert!(PhysicsSystem::sphere_capsule(Vec3::new(1.0, 1.0, 0.0), 0.3, Vec3::ZERO, &collider).is_none());
        assert!(PhysicsSystem::sphere_capsule(Vec3::new(0.0, 2.6, 0.0), 0.3, Vec3::ZERO, &collider).is_none());
    }
}
