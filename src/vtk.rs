//! Export of cornerstone trees for visualisation in ParaView.

use std::{io, path::Path};

use vtkio::{
    model::{
        Attribute, Attributes, ByteOrder, CellType, Cells, DataArrayBase, DataSet, ElementType,
        IOBuffer, Piece, UnstructuredGridPiece, VertexNumbers,
    },
    Vtk,
};

use crate::{
    cornerstone::n_nodes,
    geometry::PhysicalBox,
    morton::{grid_size, tree_level, IBox, SfcKey},
};

// Corners of a hexahedron in VTK vertex order.
const HEX_CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Build an unstructured grid with one hexahedron per leaf of `tree`.
///
/// Every cell carries its particle count from `counts` and its level.
pub fn tree_vtk_model<K: SfcKey>(
    tree: &[K],
    counts: &[usize],
    bounding_box: &PhysicalBox,
    title: &str,
) -> Vtk {
    let n_leaves = n_nodes(tree);
    assert_eq!(counts.len(), n_leaves);

    let n = grid_size::<K>() as f64;

    let mut vertices = Vec::<f64>::with_capacity(3 * 8 * n_leaves);
    let mut connectivity = Vec::<u64>::with_capacity(8 * n_leaves);
    let mut offsets = Vec::<u64>::with_capacity(n_leaves);
    let mut levels = Vec::<u64>::with_capacity(n_leaves);

    for leaf in 0..n_leaves {
        let cell = IBox::from_key_range(tree[leaf], tree[leaf + 1]);
        levels.push(tree_level(tree[leaf + 1] - tree[leaf]) as u64);

        for corner in HEX_CORNERS {
            let reference = [0, 1, 2].map(|d: usize| {
                let index = if corner[d] == 0 {
                    cell.min[d]
                } else {
                    cell.max[d]
                };
                index as f64 / n
            });
            connectivity.push((vertices.len() / 3) as u64);
            vertices.extend(bounding_box.reference_to_physical(reference));
        }

        offsets.push(connectivity.len() as u64);
    }

    let cells = Cells {
        cell_verts: VertexNumbers::XML {
            connectivity,
            offsets,
        },
        types: vec![CellType::Hexahedron; n_leaves],
    };

    let scalars = |name: &str, data: Vec<u64>| {
        Attribute::DataArray(DataArrayBase {
            name: name.to_string(),
            elem: ElementType::Scalars {
                num_comp: 1,
                lookup_table: None,
            },
            data: IOBuffer::new(data),
        })
    };

    let attributes = Attributes {
        point: Vec::new(),
        cell: vec![
            scalars("count", counts.iter().map(|&count| count as u64).collect()),
            scalars("level", levels),
        ],
    };

    let piece = UnstructuredGridPiece {
        points: IOBuffer::new(vertices),
        cells,
        data: attributes,
    };

    Vtk {
        version: (2, 2).into(),
        title: title.to_string(),
        byte_order: ByteOrder::LittleEndian,
        data: DataSet::UnstructuredGrid {
            meta: None,
            pieces: vec![Piece::Inline(Box::new(piece))],
        },
        file_path: None,
    }
}

/// Write the leaves of `tree` with their particle counts to a VTK file.
///
/// The file format follows the extension of `path`, e.g. `.vtu` for XML.
pub fn export_tree<K: SfcKey>(
    tree: &[K],
    counts: &[usize],
    bounding_box: &PhysicalBox,
    path: impl AsRef<Path>,
) -> Result<(), io::Error> {
    let model = tree_vtk_model(tree, counts, bounding_box, "cornerstone tree");
    model.export(path).map_err(|error| match error {
        vtkio::Error::IO(io) => io,
        _ => io::Error::from(io::ErrorKind::Other),
    })
}

#[cfg(test)]
mod test {
    use vtkio::model::{DataSet, Piece};

    use super::tree_vtk_model;
    use crate::{cornerstone::OctreeMaker, geometry::PhysicalBox};

    #[test]
    fn test_tree_model() {
        let tree = OctreeMaker::<u32>::new().divide(&[]).divide(&[7]).make_tree();
        let counts = vec![1; 15];
        let bounding_box = PhysicalBox::new([0.0, 0.0, 0.0, 2.0, 2.0, 2.0]);

        let model = tree_vtk_model(&tree, &counts, &bounding_box, "test");

        let DataSet::UnstructuredGrid { pieces, .. } = model.data else {
            panic!("expected an unstructured grid");
        };
        let Piece::Inline(piece) = &pieces[0] else {
            panic!("expected an inline piece");
        };

        assert_eq!(piece.cells.types.len(), 15);
        assert_eq!(piece.num_points(), 8 * 15);
        assert_eq!(piece.data.cell.len(), 2);

        // The last leaf is the upper corner cell on level 2.
        let points: Vec<f64> = piece.points.clone().into_vec().unwrap();
        let last_corner = &points[points.len() - 6..points.len() - 3];
        assert_eq!(last_corner, &[2.0, 2.0, 2.0]);
    }
}
