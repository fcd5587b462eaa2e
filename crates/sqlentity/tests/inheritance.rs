use sqlentity::prelude::*;
use sqlentity_testkit::RecordingConnection;
use std::any::Any;

#[derive(Debug, Default)]
struct Vehicle {
    id: i64,
    name: String,
}

#[derive(Debug, Default)]
struct Truck {
    id: i64,
    name: String,
    payload: Option<i64>,
}

impl Entity for Vehicle {
    fn entity_type(&self) -> &'static str {
        "Vehicle"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::BigInt(self.id)),
            "name" => Some(self.name.clone().into()),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = value.try_into()?,
            "name" => self.name = value.try_into()?,
            _ => return Err(unknown_field("Vehicle", field)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Entity for Truck {
    fn entity_type(&self) -> &'static str {
        "Truck"
    }

    fn get_field(&self, field: &str) -> Option<Value> {
        match field {
            "id" => Some(Value::BigInt(self.id)),
            "name" => Some(self.name.clone().into()),
            "payload" => Some(self.payload.into()),
            _ => None,
        }
    }

    fn set_field(&mut self, field: &str, value: Value) -> Result<()> {
        match field {
            "id" => self.id = value.try_into()?,
            "name" => self.name = value.try_into()?,
            "payload" => self.payload = value.try_into()?,
            _ => return Err(unknown_field("Truck", field)),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn fleet(conn: &RecordingConnection) -> EntityManager<RecordingConnection> {
    EntityManagerBuilder::new()
        .entity(
            EntityMetadata::new("Vehicle", "vehicles", || Box::new(Vehicle::default()))
                .field(FieldMapping::id("id", SqlType::BigInt))
                .field(FieldMapping::new("name", SqlType::Text))
                .inheritance(
                    InheritanceMapping::new("kind")
                        .value("vehicle")
                        .subtype("vehicle", "Vehicle")
                        .subtype("truck", "Truck"),
                ),
        )
        .entity(
            EntityMetadata::new("Truck", "vehicles", || Box::new(Truck::default()))
                .field(FieldMapping::id("id", SqlType::BigInt))
                .field(FieldMapping::new("name", SqlType::Text))
                .field(FieldMapping::new("payload", SqlType::BigInt).nullable(true))
                .inheritance(InheritanceMapping::new("kind").value("truck")),
        )
        .build(conn.clone())
        .expect("fleet metadata is valid")
}

fn vehicle_row(id: i64, kind: &str, payload: Option<i64>) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("name", Value::from(format!("{kind} {id}"))),
        ("payload", Value::from(payload)),
        ("kind", Value::from(kind)),
    ])
}

#[test]
fn discriminator_selects_concrete_type() {
    let conn = RecordingConnection::new();
    conn.respond("SELECT * FROM \"vehicles\"", vec![vehicle_row(1, "truck", Some(12))]);
    let mut em = fleet(&conn);

    let found = em.find("Vehicle", 1_i64).unwrap().expect("row exists");
    assert_eq!(found.entity_type(), "Truck");
    assert_eq!(
        found.with(|truck: &Truck| truck.payload).unwrap(),
        Some(12)
    );

    let as_truck = em.find("Truck", 1_i64).unwrap().expect("row exists");
    let as_vehicle = em.find("Vehicle", 1_i64).unwrap().expect("row exists");
    assert!(as_truck.ptr_eq(&found));
    assert!(as_vehicle.ptr_eq(&found));
    assert_eq!(conn.statements_starting_with("SELECT").len(), 1);
}

#[test]
fn unknown_discriminator_hydrates_declared_type() {
    let conn = RecordingConnection::new();
    let mut em = fleet(&conn);
    let row = vehicle_row(2, "bicycle", None);

    let hydrated = em.hydrate(&row, "Vehicle", HydrationMode::Detached).unwrap();
    assert_eq!(hydrated.entity_type(), "Vehicle");
}

#[test]
fn subtype_insert_writes_discriminator() {
    let conn = RecordingConnection::new();
    let mut em = fleet(&conn);
    let truck = EntityRef::new(Truck {
        id: 5,
        name: "Hauler".to_string(),
        payload: Some(40),
    });
    em.persist(&truck).unwrap();
    em.flush().unwrap();

    let writes = conn.committed_writes();
    assert_eq!(writes.len(), 1);
    assert!(writes[0].starts_with("INSERT INTO \"vehicles\""));
    assert!(writes[0].sql.contains("\"kind\""));
    assert_eq!(writes[0].params.last(), Some(&Value::from("truck")));
}
