//! Nascent animation set: drivers, curves and named animations.
//!
//! An animation set binds named parameters to either sampled curves
//! (animation drivers) or fixed values (constant drivers). Named
//! animations select a contiguous driver range plus a time range.

use cinder_block::{BlockSerializer, SerializeBlock, SpecialBuffer};
use cinder_scaffold::hash::hash64;
use cinder_scaffold::skeleton::{AnimationDesc, AnimationDriver, ConstantDriver};

use crate::GeoProcError;

/// Key formats stored in a raw animation curve.
pub mod curve_format {
    pub const F32: u32 = 1;
    pub const F32X3: u32 = 2;
    pub const F32X4: u32 = 3;
}

/// A sampled curve: time markers plus packed key data.
#[derive(Debug, Clone, Default)]
pub struct RawAnimationCurve {
    pub time_markers: Vec<f32>,
    pub key_data: Vec<u8>,
    pub key_format: u32,
    pub elements_per_key: u32,
}

impl RawAnimationCurve {
    pub fn time_range(&self) -> (f32, f32) {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &t in &self.time_markers {
            min = min.min(t);
            max = max.max(t);
        }
        if self.time_markers.is_empty() {
            (0.0, 0.0)
        } else {
            (min, max)
        }
    }
}

impl SerializeBlock for RawAnimationCurve {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_sub_block(&self.time_markers, SpecialBuffer::Vector);
        serializer.serialize_sub_block(&self.key_data, SpecialBuffer::Vector);
        serializer.serialize_u32(self.key_format);
        serializer.serialize_u32(self.elements_per_key);
    }
}

struct AnimationEntry {
    name: String,
    desc: AnimationDesc,
}

impl SerializeBlock for AnimationEntry {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_string(&self.name);
        serializer.serialize_raw(bytemuck::bytes_of(&self.desc));
    }
}

/// A set of animations and the information binding them to a skeleton.
#[derive(Debug, Clone, Default)]
pub struct NascentAnimationSet {
    drivers: Vec<AnimationDriver>,
    constant_drivers: Vec<ConstantDriver>,
    constant_data: Vec<u8>,
    animations: Vec<(String, AnimationDesc)>,
    parameter_interface: Vec<String>,
    curves: Vec<RawAnimationCurve>,
}

impl NascentAnimationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drivers(&self) -> &[AnimationDriver] {
        &self.drivers
    }

    pub fn constant_drivers(&self) -> &[ConstantDriver] {
        &self.constant_drivers
    }

    pub fn animations(&self) -> &[(String, AnimationDesc)] {
        &self.animations
    }

    pub fn curves(&self) -> &[RawAnimationCurve] {
        &self.curves
    }

    pub fn parameter_interface(&self) -> &[String] {
        &self.parameter_interface
    }

    pub fn parameter_index(&self, name: &str) -> Option<u32> {
        self.parameter_interface
            .iter()
            .position(|p| p == name)
            .map(|p| p as u32)
    }

    fn register_parameter(&mut self, name: &str) -> u32 {
        match self.parameter_index(name) {
            Some(index) => index,
            None => {
                self.parameter_interface.push(name.to_string());
                (self.parameter_interface.len() - 1) as u32
            }
        }
    }

    fn check_sampler_consistency(
        &self,
        parameter_index: u32,
        sampler_type: u32,
    ) -> Result<(), GeoProcError> {
        let conflicting = self
            .drivers
            .iter()
            .any(|d| d.parameter_index == parameter_index && d.sampler_type != sampler_type)
            || self.constant_drivers.iter().any(|d| {
                d.parameter_index == parameter_index && d.sampler_type != sampler_type
            });
        if conflicting {
            return Err(GeoProcError::InvalidData(format!(
                "inconsistent sampler types for animation parameter {}",
                self.parameter_interface
                    .get(parameter_index as usize)
                    .map(String::as_str)
                    .unwrap_or("<unknown>")
            )));
        }
        Ok(())
    }

    /// Adds a curve-driven parameter.
    pub fn add_animation_driver(
        &mut self,
        parameter_name: &str,
        curve_index: u32,
        sampler_type: u32,
        sampler_offset: u32,
    ) -> Result<(), GeoProcError> {
        let parameter_index = self.register_parameter(parameter_name);
        self.check_sampler_consistency(parameter_index, sampler_type)?;
        self.drivers.push(AnimationDriver {
            curve_index,
            parameter_index,
            sampler_type,
            sampler_offset,
        });
        Ok(())
    }

    /// Adds a constant-valued parameter.
    pub fn add_constant_driver(
        &mut self,
        parameter_name: &str,
        value: &[u8],
        format: u32,
        sampler_type: u32,
        sampler_offset: u32,
    ) -> Result<(), GeoProcError> {
        let parameter_index = self.register_parameter(parameter_name);
        self.check_sampler_consistency(parameter_index, sampler_type)?;
        let data_offset = self.constant_data.len() as u32;
        self.constant_data.extend_from_slice(value);
        self.constant_drivers.push(ConstantDriver {
            data_offset,
            data_size: value.len() as u32,
            format,
            parameter_index,
            sampler_type,
            sampler_offset,
        });
        Ok(())
    }

    pub fn has_animation_driver(&self, parameter_name: &str) -> bool {
        match self.parameter_index(parameter_name) {
            Some(index) => self.drivers.iter().any(|d| d.parameter_index == index),
            None => false,
        }
    }

    pub fn add_curve(&mut self, curve: RawAnimationCurve) -> u32 {
        self.curves.push(curve);
        (self.curves.len() - 1) as u32
    }

    pub fn add_animation(
        &mut self,
        name: &str,
        driver_begin: u32,
        driver_end: u32,
        constant_begin: u32,
        constant_end: u32,
        min_time: f32,
        max_time: f32,
    ) -> Result<(), GeoProcError> {
        if self.animations.iter().any(|(n, _)| n == name) {
            return Err(GeoProcError::InvalidData(format!(
                "animation {name} registered twice"
            )));
        }
        self.animations.push((
            name.to_string(),
            AnimationDesc {
                begin_time: min_time,
                end_time: max_time,
                driver_begin,
                driver_end,
                constant_begin,
                constant_end,
            },
        ));
        Ok(())
    }

    fn driven_time_range(&self, driver_begin: u32, driver_end: u32) -> (f32, f32) {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for driver in &self.drivers[driver_begin as usize..driver_end as usize] {
            if let Some(curve) = self.curves.get(driver.curve_index as usize) {
                let (lo, hi) = curve.time_range();
                min = min.min(lo);
                max = max.max(hi);
            }
        }
        if min > max { (0.0, 0.0) } else { (min, max) }
    }

    /// Wraps every currently unowned driver into a single named
    /// animation. A set holding only constant drivers still produces an
    /// animation record, with an empty driver range.
    pub fn make_individual_animation(&mut self, name: &str) -> Result<(), GeoProcError> {
        let driver_begin = self
            .animations
            .iter()
            .map(|(_, a)| a.driver_end)
            .max()
            .unwrap_or(0);
        let driver_end = self.drivers.len() as u32;
        let constant_begin = self
            .animations
            .iter()
            .map(|(_, a)| a.constant_end)
            .max()
            .unwrap_or(0);
        let constant_end = self.constant_drivers.len() as u32;
        let (min_time, max_time) = self.driven_time_range(driver_begin, driver_end);
        self.add_animation(
            name,
            driver_begin,
            driver_end,
            constant_begin,
            constant_end,
            min_time,
            max_time,
        )
    }

    /// Merges `other` in as one named animation covering all of its
    /// drivers.
    pub fn merge_in_as_individual_animation(
        &mut self,
        other: &NascentAnimationSet,
        name: &str,
    ) -> Result<(), GeoProcError> {
        let (driver_begin, constant_begin) = self.absorb(other)?;
        let driver_end = self.drivers.len() as u32;
        let constant_end = self.constant_drivers.len() as u32;
        let (min_time, max_time) = self.driven_time_range(driver_begin, driver_end);
        self.add_animation(
            name,
            driver_begin,
            driver_end,
            constant_begin,
            constant_end,
            min_time,
            max_time,
        )
    }

    /// Merges `other` in, keeping its animation list (optionally
    /// prefixed).
    pub fn merge_in_as_many_animations(
        &mut self,
        other: &NascentAnimationSet,
        name_prefix: &str,
    ) -> Result<(), GeoProcError> {
        let (driver_base, constant_base) = self.absorb(other)?;
        for (name, desc) in &other.animations {
            let merged_name = if name_prefix.is_empty() {
                name.clone()
            } else {
                format!("{name_prefix}{name}")
            };
            self.add_animation(
                &merged_name,
                desc.driver_begin + driver_base,
                desc.driver_end + driver_base,
                desc.constant_begin + constant_base,
                desc.constant_end + constant_base,
                desc.begin_time,
                desc.end_time,
            )?;
        }
        Ok(())
    }

    /// Copies the drivers, curves and constants of `other` into this set,
    /// remapping indices. Returns the first merged driver and constant
    /// indices.
    fn absorb(&mut self, other: &NascentAnimationSet) -> Result<(u32, u32), GeoProcError> {
        let driver_base = self.drivers.len() as u32;
        let constant_base = self.constant_drivers.len() as u32;
        let curve_base = self.curves.len() as u32;
        let data_base = self.constant_data.len() as u32;

        self.curves.extend(other.curves.iter().cloned());
        self.constant_data.extend_from_slice(&other.constant_data);

        for driver in &other.drivers {
            let name = other
                .parameter_interface
                .get(driver.parameter_index as usize)
                .ok_or_else(|| {
                    GeoProcError::InvalidData("driver references unknown parameter".into())
                })?
                .clone();
            let parameter_index = self.register_parameter(&name);
            self.check_sampler_consistency(parameter_index, driver.sampler_type)?;
            self.drivers.push(AnimationDriver {
                curve_index: driver.curve_index + curve_base,
                parameter_index,
                sampler_type: driver.sampler_type,
                sampler_offset: driver.sampler_offset,
            });
        }
        for driver in &other.constant_drivers {
            let name = other
                .parameter_interface
                .get(driver.parameter_index as usize)
                .ok_or_else(|| {
                    GeoProcError::InvalidData("constant driver references unknown parameter".into())
                })?
                .clone();
            let parameter_index = self.register_parameter(&name);
            self.check_sampler_consistency(parameter_index, driver.sampler_type)?;
            self.constant_drivers.push(ConstantDriver {
                data_offset: driver.data_offset + data_base,
                parameter_index,
                ..*driver
            });
        }
        Ok((driver_base, constant_base))
    }

    /// Serialises the animation set block.
    pub fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_sub_block(&self.drivers, SpecialBuffer::Vector);
        serializer.serialize_sub_block(&self.constant_drivers, SpecialBuffer::Vector);
        serializer.serialize_sub_block(&self.constant_data, SpecialBuffer::Vector);
        let hashed: Vec<u64> = self.parameter_interface.iter().map(|p| hash64(p)).collect();
        serializer.serialize_sub_block(&hashed, SpecialBuffer::Vector);
        let entries: Vec<AnimationEntry> = self
            .animations
            .iter()
            .map(|(name, desc)| AnimationEntry {
                name: name.clone(),
                desc: *desc,
            })
            .collect();
        serializer.serialize_items(&entries, SpecialBuffer::Vector);
        serializer.serialize_items(&self.curves, SpecialBuffer::Vector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_block::{BlockView, block_initialize};
    use cinder_scaffold::skeleton::{AnimationSet, sampler_type};

    fn sample_curve() -> RawAnimationCurve {
        RawAnimationCurve {
            time_markers: vec![0.0, 0.5, 1.0],
            key_data: bytemuck::cast_slice(&[0.0f32, 1.0, 4.0]).to_vec(),
            key_format: curve_format::F32,
            elements_per_key: 1,
        }
    }

    #[test]
    fn test_sampler_consistency_enforced() {
        let mut set = NascentAnimationSet::new();
        let curve = set.add_curve(sample_curve());
        set.add_animation_driver("arm.rotate", curve, sampler_type::FLOAT, 0)
            .unwrap();
        let conflict =
            set.add_animation_driver("arm.rotate", curve, sampler_type::FLOAT4, 0);
        assert!(matches!(conflict, Err(GeoProcError::InvalidData(_))));
    }

    #[test]
    fn test_constant_only_animation_has_empty_driver_range() {
        let mut set = NascentAnimationSet::new();
        set.add_constant_driver(
            "tint",
            bytemuck::cast_slice(&[1.0f32, 0.0, 0.0]),
            curve_format::F32X3,
            sampler_type::FLOAT3,
            0,
        )
        .unwrap();
        set.make_individual_animation("static-pose").unwrap();

        let (_, desc) = &set.animations()[0];
        assert_eq!(desc.driver_begin, desc.driver_end);
        assert_eq!(desc.constant_begin, 0);
        assert_eq!(desc.constant_end, 1);
    }

    #[test]
    fn test_individual_animation_time_range_from_curves() {
        let mut set = NascentAnimationSet::new();
        let curve = set.add_curve(sample_curve());
        set.add_animation_driver("arm.rotate", curve, sampler_type::FLOAT, 0)
            .unwrap();
        set.make_individual_animation("wave").unwrap();
        let (_, desc) = &set.animations()[0];
        assert_eq!(desc.begin_time, 0.0);
        assert_eq!(desc.end_time, 1.0);
        assert_eq!((desc.driver_begin, desc.driver_end), (0, 1));
    }

    #[test]
    fn test_merge_as_many_remaps_indices() {
        let mut walk = NascentAnimationSet::new();
        let curve = walk.add_curve(sample_curve());
        walk.add_animation_driver("hips", curve, sampler_type::FLOAT, 0)
            .unwrap();
        walk.make_individual_animation("walk").unwrap();

        let mut run = NascentAnimationSet::new();
        let curve = run.add_curve(sample_curve());
        run.add_animation_driver("hips", curve, sampler_type::FLOAT, 0)
            .unwrap();
        run.make_individual_animation("run").unwrap();

        let mut merged = NascentAnimationSet::new();
        merged.merge_in_as_many_animations(&walk, "").unwrap();
        merged.merge_in_as_many_animations(&run, "").unwrap();

        assert_eq!(merged.animations().len(), 2);
        assert_eq!(merged.curves().len(), 2);
        assert_eq!(merged.drivers().len(), 2);
        // both sets drive the same parameter; it interns once
        assert_eq!(merged.parameter_interface().len(), 1);
        let (_, run_desc) = merged
            .animations()
            .iter()
            .find(|(n, _)| n == "run")
            .unwrap();
        assert_eq!((run_desc.driver_begin, run_desc.driver_end), (1, 2));
        assert_eq!(merged.drivers()[1].curve_index, 1);
    }

    #[test]
    fn test_serialize_round_trips_through_reader() {
        let mut set = NascentAnimationSet::new();
        let curve = set.add_curve(sample_curve());
        set.add_animation_driver("hips", curve, sampler_type::FLOAT, 0)
            .unwrap();
        set.add_constant_driver(
            "tint",
            bytemuck::cast_slice(&[0.5f32]),
            curve_format::F32,
            sampler_type::FLOAT,
            0,
        )
        .unwrap();
        set.make_individual_animation("walk").unwrap();

        let mut serializer = BlockSerializer::new();
        set.serialize(&mut serializer);
        let mut block = serializer.as_memory_block();
        block_initialize(&mut block).unwrap();
        let view = BlockView::new(&block).unwrap();

        let decoded = AnimationSet::parse(&view, 0).unwrap();
        assert_eq!(decoded.drivers.len(), 1);
        assert_eq!(decoded.constant_drivers.len(), 1);
        assert_eq!(decoded.parameter_interface.len(), 2);
        assert_eq!(decoded.animations.len(), 1);
        assert_eq!(decoded.animations[0].0, "walk");
        assert_eq!(decoded.curves.len(), 1);
        assert_eq!(decoded.curves[0].time_markers, vec![0.0, 0.5, 1.0]);
        assert_eq!(decoded.curves[0].key_format, curve_format::F32);
        let walk = decoded.find_animation("walk").unwrap();
        assert_eq!(walk.end_time, 1.0);
    }
}
