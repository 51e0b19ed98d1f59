use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{Entity, EntityType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub line_number: u32,
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub weight_kg: Option<f64>,
    pub picked: bool,
    pub packed: bool,
}

impl OrderItem {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

impl Entity for OrderItem {
    const ENTITY_TYPE: EntityType = EntityType::OrderItem;

    fn id(&self) -> Uuid {
        self.id
    }
}
