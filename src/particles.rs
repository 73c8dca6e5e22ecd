//! Particle store with named, typed attribute columns.
//!
//! Every enabled attribute is a column vector; all columns always share
//! the same length. Kernels push values onto the columns they know about
//! and call [`ParticleStore::update`] to grow the remaining columns with
//! their defaults before the next read.

use glam::Vec3;

use crate::error::{Result, SimulationError};

/// Well-known attribute names.
pub const ATTR_POSITION: &str = "POSITION";
pub const ATTR_VELOCITY: &str = "VELOCITY";
pub const ATTR_AFFINE_X: &str = "AFFINEX";
pub const ATTR_AFFINE_Y: &str = "AFFINEY";
pub const ATTR_AFFINE_Z: &str = "AFFINEZ";
pub const ATTR_AGE: &str = "AGE";
pub const ATTR_LIFETIME: &str = "LIFETIME";
pub const ATTR_COLOR: &str = "COLOR";
pub const ATTR_SOURCE_ID: &str = "SOURCEID";
pub const ATTR_VISCOSITY: &str = "VISCOSITY";
pub const ATTR_ID: &str = "ID";

/// Element type of an attribute column.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttributeKind {
    Vec3,
    Float,
    Int,
    UInt16,
}

#[derive(Clone, Debug)]
struct Attribute {
    name: String,
    kind: AttributeKind,
    /// Index into the per-kind column list.
    slot: usize,
}

/// Ordered particle collection with typed attribute columns.
#[derive(Default)]
pub struct ParticleStore {
    size: usize,
    attributes: Vec<Attribute>,

    vec3_columns: Vec<Vec<Vec3>>,
    vec3_defaults: Vec<Vec3>,
    float_columns: Vec<Vec<f32>>,
    float_defaults: Vec<f32>,
    int_columns: Vec<Vec<i32>>,
    int_defaults: Vec<i32>,
    uint16_columns: Vec<Vec<u16>>,
    uint16_defaults: Vec<u16>,
}

impl ParticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of particles committed by the last `update`.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Registered attribute names in registration order.
    pub fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name == name)
    }

    pub fn attribute_kind(&self, name: &str) -> Option<AttributeKind> {
        self.attributes.iter().find(|a| a.name == name).map(|a| a.kind)
    }

    // ========== Attribute registration ==========

    fn check_new_name(&self, name: &str) -> Result<()> {
        if self.has_attribute(name) {
            return Err(SimulationError::Duplicate(format!(
                "attribute '{}' is already defined",
                name
            )));
        }
        Ok(())
    }

    pub fn add_attribute_vec3(&mut self, name: &str, default: Vec3) -> Result<()> {
        self.check_new_name(name)?;
        self.attributes.push(Attribute {
            name: name.to_string(),
            kind: AttributeKind::Vec3,
            slot: self.vec3_columns.len(),
        });
        self.vec3_columns.push(vec![default; self.size]);
        self.vec3_defaults.push(default);
        Ok(())
    }

    pub fn add_attribute_float(&mut self, name: &str, default: f32) -> Result<()> {
        self.check_new_name(name)?;
        self.attributes.push(Attribute {
            name: name.to_string(),
            kind: AttributeKind::Float,
            slot: self.float_columns.len(),
        });
        self.float_columns.push(vec![default; self.size]);
        self.float_defaults.push(default);
        Ok(())
    }

    pub fn add_attribute_int(&mut self, name: &str, default: i32) -> Result<()> {
        self.check_new_name(name)?;
        self.attributes.push(Attribute {
            name: name.to_string(),
            kind: AttributeKind::Int,
            slot: self.int_columns.len(),
        });
        self.int_columns.push(vec![default; self.size]);
        self.int_defaults.push(default);
        Ok(())
    }

    pub fn add_attribute_uint16(&mut self, name: &str, default: u16) -> Result<()> {
        self.check_new_name(name)?;
        self.attributes.push(Attribute {
            name: name.to_string(),
            kind: AttributeKind::UInt16,
            slot: self.uint16_columns.len(),
        });
        self.uint16_columns.push(vec![default; self.size]);
        self.uint16_defaults.push(default);
        Ok(())
    }

    // ========== Column access ==========

    fn slot_of(&self, name: &str, kind: AttributeKind) -> Result<usize> {
        match self.attributes.iter().find(|a| a.name == name) {
            Some(a) if a.kind == kind => Ok(a.slot),
            Some(a) => Err(SimulationError::domain(format!(
                "attribute '{}' has kind {:?}, requested {:?}",
                name, a.kind, kind
            ))),
            None => Err(SimulationError::domain(format!(
                "attribute '{}' is not defined",
                name
            ))),
        }
    }

    pub fn vec3_values(&self, name: &str) -> Result<&Vec<Vec3>> {
        let slot = self.slot_of(name, AttributeKind::Vec3)?;
        Ok(&self.vec3_columns[slot])
    }

    pub fn vec3_values_mut(&mut self, name: &str) -> Result<&mut Vec<Vec3>> {
        let slot = self.slot_of(name, AttributeKind::Vec3)?;
        Ok(&mut self.vec3_columns[slot])
    }

    pub fn float_values(&self, name: &str) -> Result<&Vec<f32>> {
        let slot = self.slot_of(name, AttributeKind::Float)?;
        Ok(&self.float_columns[slot])
    }

    pub fn float_values_mut(&mut self, name: &str) -> Result<&mut Vec<f32>> {
        let slot = self.slot_of(name, AttributeKind::Float)?;
        Ok(&mut self.float_columns[slot])
    }

    pub fn int_values(&self, name: &str) -> Result<&Vec<i32>> {
        let slot = self.slot_of(name, AttributeKind::Int)?;
        Ok(&self.int_columns[slot])
    }

    pub fn int_values_mut(&mut self, name: &str) -> Result<&mut Vec<i32>> {
        let slot = self.slot_of(name, AttributeKind::Int)?;
        Ok(&mut self.int_columns[slot])
    }

    pub fn uint16_values(&self, name: &str) -> Result<&Vec<u16>> {
        let slot = self.slot_of(name, AttributeKind::UInt16)?;
        Ok(&self.uint16_columns[slot])
    }

    pub fn uint16_values_mut(&mut self, name: &str) -> Result<&mut Vec<u16>> {
        let slot = self.slot_of(name, AttributeKind::UInt16)?;
        Ok(&mut self.uint16_columns[slot])
    }

    /// Mutable access to two distinct vec3 columns at once.
    pub fn two_vec3_values_mut(
        &mut self,
        a: &str,
        b: &str,
    ) -> Result<(&mut Vec<Vec3>, &mut Vec<Vec3>)> {
        let sa = self.slot_of(a, AttributeKind::Vec3)?;
        let sb = self.slot_of(b, AttributeKind::Vec3)?;
        if sa == sb {
            return Err(SimulationError::domain(format!(
                "cannot borrow attribute '{}' twice",
                a
            )));
        }
        if sa < sb {
            let (left, right) = self.vec3_columns.split_at_mut(sb);
            Ok((&mut left[sa], &mut right[0]))
        } else {
            let (left, right) = self.vec3_columns.split_at_mut(sa);
            Ok((&mut right[0], &mut left[sb]))
        }
    }

    // ========== Growth and removal ==========

    pub fn reserve(&mut self, n: usize) {
        for c in &mut self.vec3_columns {
            c.reserve(n);
        }
        for c in &mut self.float_columns {
            c.reserve(n);
        }
        for c in &mut self.int_columns {
            c.reserve(n);
        }
        for c in &mut self.uint16_columns {
            c.reserve(n);
        }
    }

    /// Longest column length, i.e. the size after the next `update`.
    pub fn evaluate_size(&self) -> usize {
        let mut n = 0;
        for c in &self.vec3_columns {
            n = n.max(c.len());
        }
        for c in &self.float_columns {
            n = n.max(c.len());
        }
        for c in &self.int_columns {
            n = n.max(c.len());
        }
        for c in &self.uint16_columns {
            n = n.max(c.len());
        }
        n
    }

    /// Commit pending column growth: expand every column to the longest
    /// column's length, filling with each attribute's default.
    pub fn update(&mut self) {
        let n = self.evaluate_size();
        for (c, &d) in self.vec3_columns.iter_mut().zip(&self.vec3_defaults) {
            c.resize(n, d);
        }
        for (c, &d) in self.float_columns.iter_mut().zip(&self.float_defaults) {
            c.resize(n, d);
        }
        for (c, &d) in self.int_columns.iter_mut().zip(&self.int_defaults) {
            c.resize(n, d);
        }
        for (c, &d) in self.uint16_columns.iter_mut().zip(&self.uint16_defaults) {
            c.resize(n, d);
        }
        self.size = n;
    }

    /// Remove the particles whose mask entry is true, preserving the
    /// relative order of the kept particles.
    pub fn remove_particles(&mut self, to_remove: &[bool]) -> Result<()> {
        if to_remove.len() != self.size {
            return Err(SimulationError::OutOfRange(format!(
                "removal mask length {} does not match particle count {}",
                to_remove.len(),
                self.size
            )));
        }

        fn compact<T: Copy>(column: &mut Vec<T>, to_remove: &[bool]) {
            let mut write = 0;
            for read in 0..column.len() {
                if !to_remove[read] {
                    column[write] = column[read];
                    write += 1;
                }
            }
            column.truncate(write);
        }

        for c in &mut self.vec3_columns {
            compact(c, to_remove);
        }
        for c in &mut self.float_columns {
            compact(c, to_remove);
        }
        for c in &mut self.int_columns {
            compact(c, to_remove);
        }
        for c in &mut self.uint16_columns {
            compact(c, to_remove);
        }
        self.size = to_remove.iter().filter(|&&r| !r).count();
        Ok(())
    }

    pub fn clear(&mut self) {
        for c in &mut self.vec3_columns {
            c.clear();
        }
        for c in &mut self.float_columns {
            c.clear();
        }
        for c in &mut self.int_columns {
            c.clear();
        }
        for c in &mut self.uint16_columns {
            c.clear();
        }
        self.size = 0;
    }
}
