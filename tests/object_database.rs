//! Object database multiplexing: loose + packs + alternates.

mod common;

use common::{write_pack, FixtureRepository, PackObjectSpec};
use grit::artifacts::core::CancelToken;
use grit::{AbbreviatedObjectId, ObjectType, Repository};
use pretty_assertions::assert_eq;

#[test]
fn open_falls_back_from_packs_to_loose() {
    let fixture = FixtureRepository::new();
    let token = CancelToken::none();

    let loose_id = fixture.blob(b"only loose");
    let packed = write_pack(
        &fixture.git_dir().join("objects").join("pack"),
        "pack-a",
        &[PackObjectSpec::Plain(ObjectType::Blob, b"only packed".to_vec())],
    );

    let db = fixture.repo.object_database();
    assert_eq!(
        &db.open_object(&loose_id, &token)
            .unwrap()
            .unwrap()
            .cached_bytes()
            .unwrap()[..],
        b"only loose"
    );
    assert_eq!(
        &db.open_object(&packed.ids[0], &token)
            .unwrap()
            .unwrap()
            .cached_bytes()
            .unwrap()[..],
        b"only packed"
    );
    assert!(db.has(&loose_id, &token).unwrap());
    assert!(db.has(&packed.ids[0], &token).unwrap());
}

#[test]
fn missing_object_is_none_from_database_and_error_from_reader() {
    let fixture = FixtureRepository::new();
    let token = CancelToken::none();
    let absent = common::hash_object(ObjectType::Blob, b"never stored");

    let db = fixture.repo.object_database();
    assert!(db.open_object(&absent, &token).unwrap().is_none());
    assert!(!db.has(&absent, &token).unwrap());

    let reader = fixture.repo.new_reader();
    let err = reader.open(&absent).unwrap_err();
    assert!(err.downcast_ref::<grit::MissingObject>().is_some());
}

#[test]
fn alternates_are_searched_transitively_with_cycles_tolerated() {
    let primary = FixtureRepository::new();
    let middle = FixtureRepository::new();
    let leaf = FixtureRepository::new();

    let leaf_id = leaf.blob(b"stored in the leaf alternate");
    let middle_id = middle.blob(b"stored in the middle alternate");

    let link = |from: &FixtureRepository, to: &FixtureRepository| {
        let info = from.git_dir().join("objects").join("info");
        std::fs::create_dir_all(&info).unwrap();
        let mut content = std::fs::read_to_string(info.join("alternates")).unwrap_or_default();
        content.push_str(&format!("{}\n", to.git_dir().join("objects").display()));
        std::fs::write(info.join("alternates"), content).unwrap();
    };
    link(&primary, &middle);
    link(&middle, &leaf);
    // cycle back to the primary must not hang or duplicate
    link(&leaf, &primary);

    let token = CancelToken::none();
    let db = primary.repo.object_database();
    assert_eq!(
        &db.open_object(&middle_id, &token)
            .unwrap()
            .unwrap()
            .cached_bytes()
            .unwrap()[..],
        b"stored in the middle alternate"
    );
    assert_eq!(
        &db.open_object(&leaf_id, &token)
            .unwrap()
            .unwrap()
            .cached_bytes()
            .unwrap()[..],
        b"stored in the leaf alternate"
    );
}

#[test]
fn abbreviation_candidates_union_across_sources() {
    let fixture = FixtureRepository::new();
    let token = CancelToken::none();

    // one real object, plus staged loose file names sharing its first
    // two nibbles to force a collision at a short prefix
    let real = fixture.blob(b"real object");
    let first_two = &real.to_hex()[..2];
    let objects = fixture.git_dir().join("objects").join(first_two);
    std::fs::create_dir_all(&objects).unwrap();
    let fabricated = format!("{}{}", &real.to_hex()[2..4], "77".repeat(18));
    if fabricated != real.to_hex()[2..] {
        std::fs::write(objects.join(&fabricated), b"").unwrap();
    }

    let prefix = AbbreviatedObjectId::from_hex(&real.to_hex()[..4]).unwrap();
    let candidates = fixture
        .repo
        .object_database()
        .resolve_candidates(&prefix, 8, &token)
        .unwrap();
    assert_eq!(candidates.len(), 2);
    assert!(candidates.contains(&real));

    // the longer unique prefix resolves cleanly
    let unique = AbbreviatedObjectId::from_hex(&real.to_hex()[..20]).unwrap();
    assert_eq!(
        fixture.repo.object_database().resolve(&unique, &token).unwrap(),
        Some(real)
    );
}

#[test]
fn inserted_objects_verify_and_round_trip_by_reopening() {
    use fake::faker::lorem::en::Words;
    use fake::Fake;

    let fixture = FixtureRepository::new();
    let content = Words(5..10).fake::<Vec<String>>().join(" ");
    let id = fixture.blob(content.as_bytes());

    let reopened = Repository::open(fixture.git_dir()).unwrap();
    let loader = reopened.new_reader().open(&id).unwrap();
    assert_eq!(loader.kind(), ObjectType::Blob);
    assert_eq!(&loader.cached_bytes().unwrap()[..], content.as_bytes());
}
