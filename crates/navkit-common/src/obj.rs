//! Wavefront OBJ loading for file meshes

use std::path::Path;

use glam::Vec3;

use crate::scene::{Mesh, MeshPart, MeshType, PrimFlags, Primitive};
use crate::{Error, Result};

fn parse_coord<'a>(tokens: &mut impl Iterator<Item = &'a str>, axis: &str, line: usize) -> Result<f32> {
    tokens
        .next()
        .ok_or_else(|| Error::InvalidMesh(format!("line {}: vertex is missing {}", line, axis)))?
        .parse::<f32>()
        .map_err(|_| Error::InvalidMesh(format!("line {}: vertex {} is not a number", line, axis)))
}

/// Parses OBJ text into a single mesh part.
///
/// Only `v` and `f` records are read; faces with more than three corners are fan
/// triangulated and negative (relative) indices are supported.
pub fn parse_obj_mesh(content: &str) -> Result<MeshPart> {
    let mut part = MeshPart::default();

    for (line_no, line) in content.lines().enumerate() {
        let line_no = line_no + 1;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("v") => {
                let x = parse_coord(&mut tokens, "x", line_no)?;
                let y = parse_coord(&mut tokens, "y", line_no)?;
                let z = parse_coord(&mut tokens, "z", line_no)?;
                part.vertices.push(Vec3::new(x, y, z));
            }
            Some("f") => {
                let mut face = Vec::new();
                for token in tokens {
                    let index_str = token.split('/').next().unwrap_or_default();
                    let index = index_str.parse::<i64>().map_err(|_| {
                        Error::InvalidMesh(format!("line {}: bad face index '{}'", line_no, token))
                    })?;
                    let resolved = if index < 0 {
                        part.vertices.len() as i64 + index
                    } else {
                        index - 1
                    };
                    if resolved < 0 || resolved >= part.vertices.len() as i64 {
                        return Err(Error::InvalidMesh(format!(
                            "line {}: face index {} out of range",
                            line_no, index
                        )));
                    }
                    face.push(resolved as u32);
                }
                if face.len() < 3 {
                    return Err(Error::InvalidMesh(format!(
                        "line {}: face has fewer than 3 vertices",
                        line_no
                    )));
                }
                for i in 1..face.len() - 1 {
                    part.primitives
                        .push(Primitive::new(face[0], face[i], face[i + 1], PrimFlags::empty()));
                }
            }
            _ => {}
        }
    }

    Ok(part)
}

/// Loads an OBJ file as a `FileMesh`.
///
/// A missing or unreadable file is not an error: it is logged and the mesh is
/// returned with no parts, so instances of it contribute no geometry.
pub fn load_obj_mesh(path: impl AsRef<Path>, name: &str) -> Mesh {
    let path = path.as_ref();
    let parts = match std::fs::read_to_string(path)
        .map_err(Error::from)
        .and_then(|text| parse_obj_mesh(&text))
    {
        Ok(part) => vec![part],
        Err(e) => {
            log::warn!("Mesh '{}' could not be loaded from {}: {}", name, path.display(), e);
            Vec::new()
        }
    };
    Mesh::new(name, MeshType::FileMesh, parts)
}
