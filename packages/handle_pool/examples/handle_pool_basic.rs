//! Example demonstrating the main pieces of `handle_pool`: anonymous and named pools, owning and
//! weak handles, type-erased dispatch through the registry and saving pool contents.

use handle_pool::{
    ByteReader, ByteWriter, Locator, Loaders, MemorySource, NamedPool, Pool, Registry, SaveMode,
};

fn main() {
    let registry = Registry::new();

    println!("=== Anonymous pool ===");

    let pool = Pool::<String>::builder().name("messages").build(&registry);

    let greeting = pool.acquire("Hello".to_string());
    let weak = greeting.weak();

    greeting.get_mut().push_str(", world");
    println!("Value: {}", *greeting.get());
    println!("Strong count: {}", greeting.count());

    drop(greeting);
    println!("Weak handle still locks: {}", pool.lock(weak).is_some());

    println!("\n=== Named pool ===");

    let textures = NamedPool::<String, Vec<u8>>::builder()
        .name("textures")
        .resource_factory(|locator, bytes| {
            (locator.scheme() == "texture").then(|| (locator.path().to_string(), bytes.to_vec()))
        })
        .build(&registry);

    let (grass, is_new) = textures.acquire("grass".to_string(), vec![0x22, 0x8b, 0x22]);
    println!("grass inserted: {is_new}");

    let (again, is_new) = textures.acquire("grass".to_string(), vec![]);
    println!("grass inserted again: {is_new}, same handle: {}", grass == again);

    println!("\n=== Registry dispatch ===");

    let erased = grass.clone().erase();
    println!(
        "Erased handle in pool {:?} has {} references",
        erased.pool_id(),
        erased.count()
    );

    let mut source = MemorySource::new();
    source.insert(Locator::new("texture", "stone"), vec![0x80; 3]);

    let mut loaders = Loaders::new();
    loaders.add(0, source);

    match registry.load_resource(&loaders, &Locator::new("texture", "stone")) {
        Ok(stone) => println!(
            "Loaded stone into pool {:?}, pool now holds {} textures",
            stone.pool_id(),
            textures.len()
        ),
        Err(error) => println!("Loading failed: {error}"),
    }

    println!("\n=== Persistence ===");

    let mut writer = ByteWriter::new();
    textures.save(&mut writer, SaveMode::Full);
    let saved = writer.into_bytes();
    println!("Saved {} bytes", saved.len());

    let restored = NamedPool::<String, Vec<u8>>::new(&registry);
    match restored.load(&mut ByteReader::new(&saved), SaveMode::Full) {
        Ok(summary) => println!(
            "Restored {} entries, grass present: {}",
            summary.added,
            restored.contains_key("grass")
        ),
        Err(error) => println!("Restoring failed: {error}"),
    }
}
