//! Representación tensorial de un subgrafo para la GNN.

use std::collections::HashMap;

use ndarray::{Array1, Array2};

use crate::error::{FraudError, FraudResult};
use crate::features::FeatureExtractor;
use crate::models::{EdgeRecord, NodeRecord};

/// Matriz de features (N x D), pares de aristas en índices de fila y
/// etiquetas opcionales alineadas con las filas.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphTensor {
    pub node_ids: Vec<String>,
    pub features: Array2<f32>,
    pub edge_index: Vec<(usize, usize)>,
    pub labels: Option<Array1<f32>>,
    /// Etiqueta a nivel de grafo (ejemplo de entrenamiento).
    pub graph_label: Option<f32>,
}

impl GraphTensor {
    /// Construye el tensor a partir de los registros del subgrafo.
    ///
    /// Las filas siguen el orden de `nodes`; una arista hacia un nodo que no
    /// está en `nodes` es un error, nunca se descarta.
    pub fn build(
        extractor: &FeatureExtractor,
        nodes: &[NodeRecord],
        edges: &[EdgeRecord],
        labels: Option<&[f32]>,
    ) -> FraudResult<Self> {
        let rows = nodes
            .iter()
            .map(|node| Ok((node.id().to_string(), extractor.extract(node)?)))
            .collect::<FraudResult<Vec<_>>>()?;
        let pairs: Vec<(&str, &str)> = edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect();
        Self::from_rows(rows, &pairs, labels)
    }

    pub fn from_rows(
        rows: Vec<(String, Vec<f32>)>,
        edges: &[(&str, &str)],
        labels: Option<&[f32]>,
    ) -> FraudResult<Self> {
        let n = rows.len();
        let d = rows.first().map(|(_, v)| v.len()).unwrap_or(0);

        if let Some(labels) = labels {
            if labels.len() != n {
                return Err(FraudError::LabelMismatch {
                    labels: labels.len(),
                    nodes: n,
                });
            }
        }

        let mut index: HashMap<String, usize> = HashMap::with_capacity(n);
        let mut node_ids = Vec::with_capacity(n);
        let mut flat = Vec::with_capacity(n * d);
        for (row, (id, values)) in rows.into_iter().enumerate() {
            if values.len() != d {
                return Err(FraudError::FeatureLength {
                    node_id: id,
                    expected: d,
                    found: values.len(),
                });
            }
            if index.insert(id.clone(), row).is_some() {
                return Err(FraudError::InvalidArgument(format!(
                    "Nodo duplicado en la construcción del tensor: {id}"
                )));
            }
            flat.extend(values);
            node_ids.push(id);
        }

        let edge_index = edges
            .iter()
            .map(|(source, target)| {
                let lookup = |id: &str| {
                    index.get(id).copied().ok_or_else(|| FraudError::MissingNode {
                        node_id: id.to_string(),
                    })
                };
                Ok((lookup(source)?, lookup(target)?))
            })
            .collect::<FraudResult<Vec<_>>>()?;

        let features = Array2::from_shape_vec((n, d), flat)
            .map_err(|e| FraudError::InvalidArgument(e.to_string()))?;

        Ok(Self {
            node_ids,
            features,
            edge_index,
            labels: labels.map(|l| Array1::from(l.to_vec())),
            graph_label: None,
        })
    }

    pub fn with_graph_label(mut self, label: f32) -> Self {
        self.graph_label = Some(label);
        self
    }

    pub fn num_nodes(&self) -> usize {
        self.features.nrows()
    }

    pub fn num_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.num_nodes() == 0
    }

    pub fn row_of(&self, id: &str) -> Option<usize> {
        self.node_ids.iter().position(|n| n == id)
    }

    /// Matriz de propagación normalizada `D^-1/2 (A + I) D^-1/2`.
    ///
    /// Las aristas se tratan como no dirigidas y las repetidas cuentan una vez.
    pub fn propagation_matrix(&self) -> Array2<f32> {
        let n = self.num_nodes();
        let mut adj = Array2::<f32>::eye(n);
        for &(s, t) in &self.edge_index {
            adj[[s, t]] = 1.0;
            adj[[t, s]] = 1.0;
        }
        let inv_sqrt: Vec<f32> = adj
            .rows()
            .into_iter()
            .map(|row| 1.0 / row.sum().sqrt())
            .collect();
        for ((i, j), value) in adj.indexed_iter_mut() {
            *value *= inv_sqrt[i] * inv_sqrt[j];
        }
        adj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RelType, Transaction, User};

    fn rows(ids: &[&str]) -> Vec<(String, Vec<f32>)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), vec![i as f32, 1.0]))
            .collect()
    }

    #[test]
    fn edges_are_translated_to_row_indices() {
        let t = GraphTensor::from_rows(rows(&["T1", "U1", "T2"]), &[("T1", "U1"), ("T1", "T2")], None)
            .unwrap();
        assert_eq!(t.edge_index, vec![(0, 1), (0, 2)]);
        assert!(t.edge_index.iter().all(|&(s, d)| s < t.num_nodes() && d < t.num_nodes()));
        assert_eq!(t.row_of("T2"), Some(2));
    }

    #[test]
    fn edge_to_unknown_node_is_an_error() {
        let err = GraphTensor::from_rows(rows(&["T1"]), &[("T1", "U9")], None).unwrap_err();
        assert!(matches!(err, FraudError::MissingNode { node_id } if node_id == "U9"));
    }

    #[test]
    fn ragged_features_are_an_error() {
        let mut r = rows(&["A", "B"]);
        r[1].1.push(7.0);
        let err = GraphTensor::from_rows(r, &[], None).unwrap_err();
        assert!(matches!(
            err,
            FraudError::FeatureLength { node_id, expected: 2, found: 3 } if node_id == "B"
        ));
    }

    #[test]
    fn label_count_must_match_nodes() {
        let err = GraphTensor::from_rows(rows(&["A", "B"]), &[], Some(&[1.0])).unwrap_err();
        assert!(matches!(err, FraudError::LabelMismatch { labels: 1, nodes: 2 }));
    }

    #[test]
    fn row_order_is_deterministic() {
        let a = GraphTensor::from_rows(rows(&["X", "Y", "Z"]), &[("Z", "X")], None).unwrap();
        let b = GraphTensor::from_rows(rows(&["X", "Y", "Z"]), &[("Z", "X")], None).unwrap();
        assert_eq!(a.node_ids, b.node_ids);
        assert_eq!(a, b);
    }

    #[test]
    fn build_extracts_features_from_records() {
        let nodes = vec![
            NodeRecord::Transaction(Transaction {
                id: "T1".into(),
                amount: 10.0,
                timestamp: String::new(),
                user_id: "U1".into(),
                features: vec![1.0; 6],
                label: None,
                fraud_probability: None,
            }),
            NodeRecord::User(User {
                id: "U1".into(),
                risk_score: 0.2,
                created_at: String::new(),
                name: None,
            }),
        ];
        let edges = vec![EdgeRecord::new("T1", "U1", RelType::BelongsTo)];
        let t = GraphTensor::build(&FeatureExtractor::default(), &nodes, &edges, None).unwrap();
        assert_eq!(t.features.dim(), (2, 6));
        assert_eq!(t.edge_index, vec![(0, 1)]);
    }

    #[test]
    fn propagation_matrix_is_symmetric_and_normalised() {
        let t = GraphTensor::from_rows(rows(&["A", "B", "C"]), &[("A", "B"), ("B", "A")], None).unwrap();
        let p = t.propagation_matrix();
        assert_eq!(p, p.t());
        // A y B: grado 2 con el self-loop; C aislado conserva 1.
        assert!((p[[0, 1]] - 0.5).abs() < 1e-6);
        assert!((p[[2, 2]] - 1.0).abs() < 1e-6);
        assert_eq!(p[[0, 2]], 0.0);
    }
}
