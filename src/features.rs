//! Extracción de features con un esquema explícito y versionado.
//!
//! Cada posición del vector corresponde a un atributo con nombre y escala.
//! Las transacciones deben traer su vector crudo, ya escalado y de la
//! longitud del esquema; una transacción sin vector es un error de
//! validación. El resto de nodos rellena cada posición con su atributo
//! numérico escalado o con el valor por defecto del campo.
//! La etiqueta y la probabilidad almacenada nunca forman parte del vector.

use serde::{Deserialize, Serialize};

use crate::error::{FraudError, FraudResult};
use crate::models::{NodeRecord, Transaction};

/// Escala de `amount` en el esquema v1 (importes de hasta 10 000).
pub const AMOUNT_SCALE: f64 = 1.0 / 10_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    /// Valor de la posición cuando el nodo no tiene el atributo (sin escalar).
    pub default: f64,
    /// Factor aplicado al atributo antes de colocarlo en el vector.
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fields: Vec<FeatureField>,
}

impl FeatureSchema {
    /// Esquema v1: la disposición de seis columnas de los datos de muestra.
    pub fn standard() -> Self {
        let names = [
            "amount",
            "time_of_day",
            "day_of_week",
            "amount_deviation",
            "location_deviation",
            "risk_score",
        ];
        Self {
            version: 1,
            fields: names
                .iter()
                .map(|name| FeatureField {
                    name: name.to_string(),
                    default: 0.0,
                    scale: if *name == "amount" { AMOUNT_SCALE } else { 1.0 },
                })
                .collect(),
        }
    }

    pub fn dim(&self) -> usize {
        self.fields.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Vector en el orden del esquema a partir de atributos con nombre.
    pub fn assemble(&self, attribute: impl Fn(&str) -> Option<f64>) -> Vec<f64> {
        self.fields
            .iter()
            .map(|field| match attribute(&field.name) {
                Some(value) => value * field.scale,
                None => field.default,
            })
            .collect()
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
}

impl FeatureExtractor {
    pub fn new(schema: FeatureSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn dim(&self) -> usize {
        self.schema.dim()
    }

    /// Comprueba que la transacción traiga un vector de la dimensión del esquema.
    pub fn check_transaction(&self, transaction: &Transaction) -> FraudResult<()> {
        if transaction.features.len() != self.dim() {
            return Err(FraudError::FeatureLength {
                node_id: transaction.id.clone(),
                expected: self.dim(),
                found: transaction.features.len(),
            });
        }
        Ok(())
    }

    pub fn extract(&self, node: &NodeRecord) -> FraudResult<Vec<f32>> {
        let values = match node {
            NodeRecord::Transaction(t) => {
                self.check_transaction(t)?;
                t.features.clone()
            }
            NodeRecord::User(_) => self.schema.assemble(|name| node.numeric_attribute(name)),
        };
        Ok(values.into_iter().map(|v| v as f32).collect())
    }
}
