//! Mesh exporters
//!
//! Every output format reads the same [`MeshBuffer`]; a format only decides how
//! the buffer is written.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{MapError, MapResult};
use crate::mesh::MeshBuffer;

/// Writes a mesh buffer in some interchange format
pub trait MeshExporter: Send + Sync {
    /// File extension without the dot
    fn extension(&self) -> &'static str;

    /// Write the mesh to any sink
    fn write(&self, mesh: &MeshBuffer, out: &mut dyn Write) -> MapResult<()>;

    /// Write the mesh to a file
    fn write_file(&self, mesh: &MeshBuffer, path: &Path) -> MapResult<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.write(mesh, &mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Render the mesh into memory
    fn to_bytes(&self, mesh: &MeshBuffer) -> MapResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write(mesh, &mut bytes)?;
        Ok(bytes)
    }
}

/// Wavefront OBJ with per-vertex colors appended to `v` lines
#[derive(Debug, Clone, Default)]
pub struct ObjExporter {
    /// Also write `vn` lines and reference them from faces
    pub normals: bool,
}

impl MeshExporter for ObjExporter {
    fn extension(&self) -> &'static str {
        "obj"
    }

    fn write(&self, mesh: &MeshBuffer, out: &mut dyn Write) -> MapResult<()> {
        // Vertex lines index colors by position, so the lengths must agree
        mesh.validate()?;
        writeln!(out, "# terramesh")?;
        writeln!(
            out,
            "# {} vertices, {} triangles",
            mesh.vertex_count(),
            mesh.triangle_count()
        )?;

        for (i, p) in mesh.positions.chunks_exact(3).enumerate() {
            match &mesh.colors {
                Some(colors) => {
                    let c = &colors[i * 3..i * 3 + 3];
                    writeln!(
                        out,
                        "v {} {} {} {:.4} {:.4} {:.4}",
                        p[0], p[1], p[2], c[0], c[1], c[2]
                    )?;
                }
                None => writeln!(out, "v {} {} {}", p[0], p[1], p[2])?,
            }
        }

        if self.normals {
            for n in mesh.vertex_normals() {
                writeln!(out, "vn {:.5} {:.5} {:.5}", n[0], n[1], n[2])?;
            }
        }

        // OBJ indices are 1-based
        for t in mesh.indices.chunks_exact(3) {
            let (a, b, c) = (t[0] + 1, t[1] + 1, t[2] + 1);
            if self.normals {
                writeln!(out, "f {a}//{a} {b}//{b} {c}//{c}")?;
            } else {
                writeln!(out, "f {a} {b} {c}")?;
            }
        }
        Ok(())
    }
}

/// The buffer itself as JSON
#[derive(Debug, Clone, Default)]
pub struct JsonExporter {
    pub pretty: bool,
}

impl MeshExporter for JsonExporter {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn write(&self, mesh: &MeshBuffer, out: &mut dyn Write) -> MapResult<()> {
        if self.pretty {
            serde_json::to_writer_pretty(out, mesh)?;
        } else {
            serde_json::to_writer(out, mesh)?;
        }
        Ok(())
    }
}

/// Pick an exporter by format name (`obj` or `json`)
pub fn exporter_for(format: &str) -> MapResult<Box<dyn MeshExporter>> {
    match format.to_ascii_lowercase().as_str() {
        "obj" => Ok(Box::new(ObjExporter::default())),
        "json" => Ok(Box::new(JsonExporter::default())),
        other => Err(MapError::Configuration(format!(
            "unknown export format '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn triangle() -> MeshBuffer {
        let mut mesh = MeshBuffer::with_colors();
        let a = mesh.push_vertex(DVec3::new(0.0, 0.0, 0.0), [1.0, 0.0, 0.0]);
        let b = mesh.push_vertex(DVec3::new(1.0, 0.0, 0.0), [0.0, 1.0, 0.0]);
        let c = mesh.push_vertex(DVec3::new(0.0, 1.0, 0.0), [0.0, 0.0, 1.0]);
        mesh.push_triangle(a, b, c);
        mesh
    }

    #[test]
    fn test_obj_output() {
        let text = String::from_utf8(ObjExporter::default().to_bytes(&triangle()).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(
            lines,
            vec![
                "v 0 0 0 1.0000 0.0000 0.0000",
                "v 1 0 0 0.0000 1.0000 0.0000",
                "v 0 1 0 0.0000 0.0000 1.0000",
                "f 1 2 3",
            ]
        );
    }

    #[test]
    fn test_obj_with_normals() {
        let exporter = ObjExporter { normals: true };
        let text = String::from_utf8(exporter.to_bytes(&triangle()).unwrap()).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("vn ")).count(), 3);
        assert!(text.contains("vn 0.00000 0.00000 1.00000"));
        assert!(text.contains("f 1//1 2//2 3//3"));
    }

    #[test]
    fn test_obj_rejects_short_color_list() {
        let mut mesh = triangle();
        if let Some(colors) = mesh.colors.as_mut() {
            colors.truncate(6);
        }
        let mut bytes = Vec::new();
        let result = ObjExporter::default().write(&mesh, &mut bytes);
        assert!(matches!(result, Err(MapError::Validation(_))));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_json_preserves_buffer() {
        let mesh = triangle();
        let bytes = JsonExporter::default().to_bytes(&mesh).unwrap();
        let parsed: MeshBuffer = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, mesh);
    }

    #[test]
    fn test_write_file_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = exporter_for("OBJ").unwrap();
        let path = dir.path().join(format!("model.{}", exporter.extension()));
        exporter.write_file(&triangle(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("f 1 2 3"));
        assert!(exporter_for("stl").is_err());
    }
}
