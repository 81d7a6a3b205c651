use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;

use firestore_offline_sync::api::{FirestoreClient, FirestoreSettings, ListenOptions};
use firestore_offline_sync::core::Query;
use firestore_offline_sync::model::{DatabaseId, DocumentKey, Mutation, Precondition, ResourcePath};
use firestore_offline_sync::remote::{InMemoryTransport, MultiplexedConnection, NoopTokenProvider, StreamingDatastoreImpl};
use firestore_offline_sync::value::{FirestoreValue, MapValue, ValueKind};
use firestore_offline_sync::FirestoreResult;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Replace the in-memory transport with one that reaches your backend.
    let (client_side, _backend_side) = InMemoryTransport::pair();
    let connection = Arc::new(MultiplexedConnection::new(client_side));
    let settings = FirestoreSettings::new(DatabaseId::new("demo-project", "(default)"));
    let client = FirestoreClient::new(
        settings,
        Arc::new(StreamingDatastoreImpl::new(connection)),
        Arc::new(NoopTokenProvider),
    )
    .await?;

    // Everything below works without a backend: writes land in the local
    // cache and wait in the mutation queue.
    client.disable_network().await?;
    store_cities(&client).await?;

    let cities = Query::new(ResourcePath::from_string("cities")?);
    let registration = client
        .listen(cities.clone(), ListenOptions::default(), |result| match result {
            Ok(snapshot) => println!(
                "{} cities (from cache: {}, pending writes: {})",
                snapshot.len(),
                snapshot.metadata().from_cache(),
                snapshot.metadata().has_pending_writes()
            ),
            Err(err) => eprintln!("listener failed: {err}"),
        })
        .await?;

    let snapshot = client.get_documents_from_local_cache(cities).await?;
    println!("Loaded {} cities from the local cache:", snapshot.len());
    for city in snapshot.documents() {
        let Some(data) = city.data() else { continue };
        let name = field_as_string(data, "name").unwrap_or_else(|| "Unknown".into());
        let population = field_as_i64(data, "population").unwrap_or_default();
        println!("- {name}: population {population}");
    }

    registration.remove();
    client.terminate().await?;
    Ok(())
}

async fn store_cities(client: &FirestoreClient) -> FirestoreResult<()> {
    let mut mutations = Vec::new();
    for (id, name, population) in [("SF", "San Francisco", 860_000), ("LA", "Los Angeles", 3_900_000)] {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string(name));
        fields.insert("population".to_string(), FirestoreValue::from_integer(population));
        mutations.push(Mutation::set(
            DocumentKey::from_string(&format!("cities/{id}"))?,
            MapValue::new(fields),
            Precondition::None,
        ));
    }
    client.write(mutations).await?;
    Ok(())
}

fn field_as_string(data: &BTreeMap<String, FirestoreValue>, field: &str) -> Option<String> {
    data.get(field).and_then(|value| match value.kind() {
        ValueKind::String(text) => Some(text.clone()),
        _ => None,
    })
}

fn field_as_i64(data: &BTreeMap<String, FirestoreValue>, field: &str) -> Option<i64> {
    data.get(field).and_then(|value| match value.kind() {
        ValueKind::Integer(value) => Some(*value),
        _ => None,
    })
}
