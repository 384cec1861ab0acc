//! 各格式编解码器
//!
//! 读取器把内容写入调用方提供的几何文档（由导入作用域保证失败回滚），
//! 写入器从一个只包含导出选择的几何文档输出。

pub(crate) mod brep;
pub(crate) mod iges;
pub(crate) mod step;
pub(crate) mod stl;

use nalgebra::{Quaternion, Translation3, UnitQuaternion};
use zpart_core::shape::{LabelId, LabelKind, ShapeDocument};

use crate::error::{CodecError, CodecResult};

/// 由平移和四元数分量重建定位；四元数必须已单位化
pub(crate) fn isometry_from_parts(
    translation: [f64; 3],
    rotation: [f64; 4],
) -> CodecResult<nalgebra::Isometry3<f64>> {
    let [w, i, j, k] = rotation;
    let quaternion = Quaternion::new(w, i, j, k);
    if !quaternion.norm().is_finite() || (quaternion.norm() - 1.0).abs() > 1e-6 {
        return Err(CodecError::InvalidContent(format!(
            "rotation ({w}, {i}, {j}, {k}) is not a unit quaternion"
        )));
    }
    let [x, y, z] = translation;
    Ok(nalgebra::Isometry3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::new_unchecked(quaternion),
    ))
}

/// 顶层形状的装配嵌套深度（零件为 0）
pub(crate) fn assembly_depth(shapes: &ShapeDocument, label: LabelId) -> usize {
    match shapes.label(label).map(|l| &l.kind) {
        Some(LabelKind::Assembly { components }) => {
            1 + components
                .iter()
                .map(|c| assembly_depth(shapes, shapes.referred(*c)))
                .max()
                .unwrap_or(0)
        }
        _ => 0,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! 编解码器测试共用的样例文档

    use nalgebra::{Isometry3, Point3, Vector3};
    use zpart_core::mesh::TriangleMesh;
    use zpart_core::shape::{LabelId, ShapeDocument, ShapeType};

    pub(crate) fn triangle_mesh() -> TriangleMesh {
        let mut mesh = TriangleMesh::new();
        mesh.push_triangle(
            Point3::origin(),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        );
        mesh.push_triangle(
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
        );
        mesh
    }

    /// 装配 "frame" 两次引用零件 "bolt"，另有一个带网格的零件 "plate"
    pub(crate) fn sample_document() -> (ShapeDocument, LabelId) {
        let mut shapes = ShapeDocument::new();
        let frame = shapes.add_assembly(Some("frame".into()));
        let bolt = shapes.add_part(Some("bolt".into()), ShapeType::Solid, None);
        shapes.add_sub_shape(bolt, ShapeType::Face, Some("head".into())).unwrap();
        shapes
            .add_component(frame, bolt, Isometry3::translation(10.0, 0.0, 0.0), Some("bolt-1".into()))
            .unwrap();
        let rotated = Isometry3::new(Vector3::new(0.0, 5.5, 0.0), Vector3::new(0.0, 0.0, 0.25));
        shapes
            .add_component(frame, bolt, rotated, None)
            .unwrap();
        shapes.add_part(Some("plate".into()), ShapeType::Shell, Some(triangle_mesh()));
        (shapes, frame)
    }

    /// 自由形状结构的规范描述，与标签编号无关
    pub(crate) fn describe(shapes: &ShapeDocument) -> Vec<String> {
        let mut lines = Vec::new();
        for root in shapes.free_shapes() {
            describe_label(shapes, root, 0, &mut lines);
        }
        lines
    }

    fn describe_label(shapes: &ShapeDocument, label: LabelId, depth: usize, lines: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        if shapes.is_assembly(label) {
            lines.push(format!("{indent}assembly {:?}", shapes.name(label)));
            for component in shapes.components(label) {
                let location = shapes.location(*component);
                lines.push(format!(
                    "{indent}  component {:?} at {:?} {:?}",
                    shapes.name(*component),
                    location.translation.vector,
                    location.rotation.coords
                ));
                describe_label(shapes, shapes.referred(*component), depth + 2, lines);
            }
        } else {
            lines.push(format!(
                "{indent}{:?} {:?} mesh={:?}",
                shapes.shape_type(label),
                shapes.name(label),
                shapes.mesh(label)
            ));
            for sub in shapes.sub_shapes(label) {
                lines.push(format!("{indent}  sub {:?} {:?}", shapes.shape_type(*sub), shapes.name(*sub)));
            }
        }
    }
}
