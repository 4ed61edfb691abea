//! Whole-hierarchy behaviour tests.
//!
//! Each test starts from a three-tier academic hierarchy and checks that
//! composite operations (tier insertion and deletion, directory sync,
//! membership updates, imports) leave every invariant intact.
//!
//! Fixture:
//! ```text
//! University  UMD
//! College       └─ CMNS
//! Department         ├─ PHYS  ("Physics Dept")
//!                    └─ ASTR  ("Astronomy Dept")
//! ```

use orghier_core::{
    EntityKind, HierarchyError, HierarchyResult, HierarchyStore, LevelId, MembershipRequest, OrgId,
    OrgQuery, OrgSpec, SetMembershipOptions, SyncOptions, UNKNOWN_CODE,
};
use uuid::Uuid;

/// Academic hierarchy fixture.
struct Fixture {
    store: HierarchyStore,
    univ: LevelId,
    coll: LevelId,
    dept: LevelId,
    umd: OrgId,
    cmns: OrgId,
    phys: OrgId,
    astr: OrgId,
}

impl Fixture {
    fn new() -> Self {
        let mut store = HierarchyStore::new();
        let univ = store.create_level("University", 40, None, true).unwrap();
        let coll = store.create_level("College", 30, Some(univ), true).unwrap();
        let dept = store.create_level("Department", 20, Some(coll), true).unwrap();

        let umd = store
            .insert_node(OrgSpec::new("UMD", univ).with_names("UMCP", "University of Maryland"))
            .unwrap()
            .id;
        let cmns = store
            .insert_node(OrgSpec::new("CMNS", coll).with_parent(umd).with_names(
                "CMNS",
                "College of Computer, Mathematical, and Natural Sciences",
            ))
            .unwrap()
            .id;
        let phys = store
            .insert_node(
                OrgSpec::new("PHYS", dept)
                    .with_parent(cmns)
                    .with_names("Physics", "Physics Department"),
            )
            .unwrap()
            .id;
        let astr = store
            .insert_node(
                OrgSpec::new("ASTR", dept)
                    .with_parent(cmns)
                    .with_names("Astronomy", "Astronomy Department"),
            )
            .unwrap()
            .id;
        store.add_directory_entry("Physics Dept", phys).unwrap();
        store.add_directory_entry("Astronomy Dept", astr).unwrap();

        Self {
            store,
            univ,
            coll,
            dept,
            umd,
            cmns,
            phys,
            astr,
        }
    }

    fn fullcode(&self, id: OrgId) -> String {
        self.store.orgs().fullcode(id).unwrap_or_default()
    }

    fn level_id(&self, name: &str) -> Option<LevelId> {
        self.store.levels().by_name(name).map(|l| l.id)
    }

    fn level_names(&self) -> Vec<String> {
        self.store
            .levels()
            .chain(true)
            .unwrap()
            .map(|l| l.name.clone())
            .collect()
    }
}

fn sync_options() -> SyncOptions {
    SyncOptions {
        delete: true,
        create_unknown: false,
        include_nonselectable: false,
        first_is_primary: true,
    }
}

fn primary_count(store: &HierarchyStore, kind: EntityKind, entity: Uuid) -> usize {
    store
        .memberships()
        .for_entity(kind, entity)
        .iter()
        .filter(|l| l.is_primary)
        .count()
}

#[test]
fn test_new_root_tier_round_trip() {
    let mut f = Fixture::new();
    let user = Uuid::now_v7();
    f.store.set_primary(EntityKind::User, user, f.phys).unwrap();

    let country = f.store.insert_level("Country", 50, None, true).unwrap();
    assert_eq!(f.fullcode(f.phys), "Unknown-UMD-CMNS-PHYS");
    assert_eq!(f.level_names(), vec!["Country", "University", "College", "Department"]);
    let placeholder = f.store.orgs().get(f.umd).unwrap().parent.unwrap();
    let placeholder = f.store.orgs().get(placeholder).unwrap();
    assert_eq!(placeholder.level, country);
    assert!(!placeholder.selectable_for_user);
    assert!(f.store.audit().is_ok());

    f.store.delete_level(country).unwrap();
    assert_eq!(f.fullcode(f.phys), "UMD-CMNS-PHYS");
    assert_eq!(f.level_names(), vec!["University", "College", "Department"]);
    assert_eq!(f.store.levels().root().unwrap().id, f.univ);
    assert_eq!(f.store.orgs().len(), 4);
    assert_eq!(f.store.primary(EntityKind::User, user).unwrap().org, f.phys);
    assert!(f.store.audit().is_ok());
}

#[test]
fn test_middle_tier_round_trip() {
    let mut f = Fixture::new();
    let project = Uuid::now_v7();
    f.store
        .set_memberships(
            EntityKind::Project,
            project,
            &[MembershipRequest::new(f.astr).with_primary(true)],
            SetMembershipOptions::default(),
        )
        .unwrap();

    let campus = f.store.insert_level("Campus", 35, Some(f.univ), false).unwrap();
    assert_eq!(f.fullcode(f.phys), "UMD-placeholderCMNS-CMNS-PHYS");
    assert_eq!(f.store.levels().child(campus).unwrap().id, f.coll);
    assert_eq!(f.store.orgs().at_level(campus).len(), 1);
    assert!(f.store.audit().is_ok());

    // A link on the placeholder moves up to UMD when the tier goes away
    let placeholder = f.store.orgs().at_level(campus)[0].id;
    f.store
        .set_memberships(
            EntityKind::Project,
            project,
            &[MembershipRequest::new(placeholder)],
            SetMembershipOptions::default(),
        )
        .unwrap();

    f.store.delete_level(campus).unwrap();
    assert_eq!(f.fullcode(f.phys), "UMD-CMNS-PHYS");
    assert_eq!(f.store.orgs().get(f.cmns).unwrap().parent, Some(f.umd));
    assert!(f.store.memberships().get(EntityKind::Project, project, f.umd).is_some());
    assert_eq!(f.store.primary(EntityKind::Project, project).unwrap().org, f.astr);
    assert_eq!(f.store.levels().len(), 3);
    assert!(f.store.audit().is_ok());
}

#[test]
fn test_at_most_one_primary_through_every_path() {
    let mut f = Fixture::new();
    let user = Uuid::now_v7();
    let kind = EntityKind::User;

    f.store
        .set_memberships(
            kind,
            user,
            &[
                MembershipRequest::new(f.phys).with_primary(true),
                MembershipRequest::new(f.astr),
            ],
            SetMembershipOptions::default(),
        )
        .unwrap();
    assert_eq!(primary_count(&f.store, kind, user), 1);

    f.store.set_primary(kind, user, "UMD-CMNS-ASTR").unwrap();
    assert_eq!(primary_count(&f.store, kind, user), 1);
    assert_eq!(f.store.primary(kind, user).unwrap().org, f.astr);

    f.store
        .sync_memberships(kind, user, &["Physics Dept", "Astronomy Dept"], sync_options())
        .unwrap();
    assert_eq!(primary_count(&f.store, kind, user), 1);
    assert_eq!(f.store.primary(kind, user).unwrap().org, f.phys);

    f.store
        .set_memberships(
            kind,
            user,
            &[MembershipRequest::new(f.cmns)],
            SetMembershipOptions {
                add_parents: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(primary_count(&f.store, kind, user), 1);
    assert_eq!(f.store.memberships().for_entity(kind, user).len(), 4);
    assert!(f.store.audit().is_ok());
}

#[test]
fn test_sync_is_idempotent_and_follows_first_string() {
    let mut f = Fixture::new();
    let user = Uuid::now_v7();
    let kind = EntityKind::User;
    let strings = ["Physics Dept", "Astronomy Dept"];

    let first = f.store.sync_memberships(kind, user, &strings, sync_options()).unwrap();
    assert_eq!(first.primary_set, Some(f.phys));
    let second = f.store.sync_memberships(kind, user, &strings, sync_options()).unwrap();
    assert!(second.is_empty());

    let swapped = f
        .store
        .sync_memberships(kind, user, &["Astronomy Dept", "Physics Dept"], sync_options())
        .unwrap();
    assert_eq!(swapped.primary_set, Some(f.astr));
    assert!(!f.store.memberships().get(kind, user, f.phys).unwrap().is_primary);

    let dropped = f
        .store
        .sync_memberships(kind, user, &["Astronomy Dept"], sync_options())
        .unwrap();
    assert_eq!(dropped.removed, vec![f.phys]);
    assert_eq!(f.store.memberships().for_entity(kind, user).len(), 1);
}

#[test]
fn test_unmapped_strings_become_placeholders_once() {
    let mut f = Fixture::new();
    let user = Uuid::now_v7();
    let options = SyncOptions {
        create_unknown: true,
        ..sync_options()
    };

    f.store
        .sync_memberships(EntityKind::User, user, &["Mystery Lab", "Physics Dept"], options)
        .unwrap();
    let placeholder = f.store.directory().get("Mystery Lab").unwrap().org;
    assert_eq!(f.fullcode(placeholder), "Unknown-Unknown_1");
    assert_eq!(f.store.orgs().get(placeholder).unwrap().level, f.coll);
    assert_eq!(f.store.primary(EntityKind::User, user).unwrap().org, placeholder);
    let count = f.store.orgs().len();

    let changes = f
        .store
        .sync_memberships(EntityKind::User, user, &["Mystery Lab", "Physics Dept"], options)
        .unwrap();
    assert!(changes.is_empty());
    assert_eq!(f.store.orgs().len(), count);
    assert!(f.store.audit().is_ok());
}

#[test]
fn test_names_unique_within_parent_scope_only() {
    let mut f = Fixture::new();
    let umb = f
        .store
        .create_org(OrgSpec::new("UMB", f.univ).with_names("UMB", "UMD Baltimore"))
        .unwrap()
        .id;

    // Same code under a different parent is fine
    let other = f
        .store
        .create_org(OrgSpec::new("CMNS", f.coll).with_parent(umb))
        .unwrap();
    assert!(other.created);
    assert_ne!(other.id, f.cmns);

    // Creating the same code under the same parent conflicts and changes nothing
    let count = f.store.orgs().len();
    let err = f
        .store
        .create_org(OrgSpec::new("PHYS", f.dept).with_parent(f.cmns).with_shortname("Physics 2"))
        .unwrap_err();
    assert!(matches!(err, HierarchyError::UniquenessConflict { field: "code", .. }));
    assert_eq!(f.store.orgs().len(), count);
    assert_eq!(f.store.orgs().get(f.phys).unwrap().shortname, "Physics");

    // Same short name under the same parent is not
    let err = f
        .store
        .insert_node(OrgSpec::new("GEOL", f.dept).with_parent(f.cmns).with_shortname("Physics"))
        .unwrap_err();
    assert!(matches!(err, HierarchyError::UniquenessConflict { .. }));

    // The upsert used by imports and sync updates in place instead
    let again = f
        .store
        .insert_node(OrgSpec::new("PHYS", f.dept).with_parent(f.cmns))
        .unwrap();
    assert_eq!(again.id, f.phys);
    assert!(!again.created);

    assert_eq!(
        f.store
            .list_orgs(&OrgQuery::new().at_level(f.coll))
            .iter()
            .filter(|o| o.code == "CMNS")
            .count(),
        2
    );
    assert!(f.store.audit().is_ok());
}

#[test]
fn test_failed_operations_change_nothing() {
    let mut f = Fixture::new();
    let before = f.store.orgs().len();
    let levels = f.store.levels().len();

    let err = f
        .store
        .transaction("two orgs", |tx| {
            tx.insert_node(OrgSpec::new("GEOL", f.dept).with_parent(f.cmns))?;
            tx.insert_node(OrgSpec::new("BAD", f.dept).with_parent(f.umd))
        })
        .unwrap_err();
    assert!(matches!(err, HierarchyError::StructuralMismatch { .. }));
    assert_eq!(f.store.orgs().len(), before);

    // A rank that does not fit between parent and child
    let err = f.store.insert_level("Campus", 25, Some(f.univ), true).unwrap_err();
    assert!(matches!(err, HierarchyError::InvalidRank { .. }));
    assert_eq!(f.store.levels().len(), levels);
    assert_eq!(f.fullcode(f.phys), "UMD-CMNS-PHYS");

    let err = f
        .store
        .import_orgs("GEOL|Department|UMD-CMNS\nCHEM|Department|UMD-NOPE\n", '|')
        .unwrap_err();
    assert!(matches!(err, HierarchyError::Import { line: 2, .. }));
    assert_eq!(f.store.orgs().len(), before);
    assert!(f.store.checks_enabled());
    assert!(f.store.audit().is_ok());
}

#[test]
fn test_removing_a_leaf_org_hands_links_to_parent() {
    let mut f = Fixture::new();
    let user = Uuid::now_v7();
    f.store
        .sync_memberships(EntityKind::User, user, &["Physics Dept"], sync_options())
        .unwrap();

    f.store.remove_org_from_hierarchy(f.phys).unwrap();
    assert!(f.store.orgs().get(f.phys).is_none());
    assert!(f.store.directory().get("Physics Dept").is_none());
    let link = f.store.memberships().get(EntityKind::User, user, f.cmns).unwrap();
    assert!(link.is_primary);

    let err = f.store.remove_org_from_hierarchy(f.umd).unwrap_err();
    assert!(matches!(err, HierarchyError::StructuralMismatch { .. }));
    assert!(f.store.audit().is_ok());
}

/// One step of a mixed workload; each is a no-op when it does not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    AddCountry,
    DropCountry,
    AddCampus,
    DropCampus,
    SetMemberships,
    SyncWithUnknown,
}

const STEPS: [Step; 6] = [
    Step::AddCountry,
    Step::DropCountry,
    Step::AddCampus,
    Step::DropCampus,
    Step::SetMemberships,
    Step::SyncWithUnknown,
];

impl Step {
    fn apply(self, f: &mut Fixture, user: Uuid) -> HierarchyResult<()> {
        match self {
            Step::AddCountry => {
                if f.level_id("Country").is_none() {
                    f.store.insert_level("Country", 50, None, true)?;
                }
            }
            Step::DropCountry => {
                if let Some(id) = f.level_id("Country") {
                    f.store.delete_level(id)?;
                }
            }
            Step::AddCampus => {
                if f.level_id("Campus").is_none() {
                    f.store.insert_level("Campus", 35, Some(f.univ), false)?;
                }
            }
            Step::DropCampus => {
                if let Some(id) = f.level_id("Campus") {
                    f.store.delete_level(id)?;
                }
            }
            Step::SetMemberships => {
                f.store.set_memberships(
                    EntityKind::User,
                    user,
                    &[
                        MembershipRequest::new(f.phys).with_primary(true),
                        MembershipRequest::new(f.astr),
                    ],
                    SetMembershipOptions::default(),
                )?;
            }
            Step::SyncWithUnknown => {
                let options = SyncOptions {
                    create_unknown: true,
                    ..sync_options()
                };
                f.store.sync_memberships(
                    EntityKind::User,
                    user,
                    &["Mystery Lab", "Physics Dept"],
                    options,
                )?;
            }
        }
        Ok(())
    }
}

fn orderings(steps: &[Step]) -> Vec<Vec<Step>> {
    if steps.len() <= 1 {
        return vec![steps.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..steps.len() {
        let mut rest = steps.to_vec();
        let first = rest.remove(i);
        for mut tail in orderings(&rest) {
            tail.insert(0, first);
            out.push(tail);
        }
    }
    out
}

#[test]
fn test_every_ordering_of_mixed_mutations_stays_valid() {
    let sequences = orderings(&STEPS);
    assert_eq!(sequences.len(), 720);

    for sequence in &sequences {
        let mut f = Fixture::new();
        let user = Uuid::now_v7();
        for (i, step) in sequence.iter().enumerate() {
            let done = &sequence[..=i];
            step.apply(&mut f, user)
                .unwrap_or_else(|e| panic!("{:?} failed after {:?}: {}", step, done, e));
            if let Err(e) = f.store.audit() {
                panic!("audit failed after {:?}: {}", done, e);
            }
            assert!(
                primary_count(&f.store, EntityKind::User, user) <= 1,
                "several primaries after {:?}",
                done
            );
            let containers = f
                .store
                .orgs()
                .iter()
                .filter(|o| o.code == UNKNOWN_CODE)
                .count();
            assert!(containers <= 1, "{} Unknown containers after {:?}", containers, done);
            assert!(f.fullcode(f.phys).ends_with("CMNS-PHYS"), "PHYS moved after {:?}", done);
        }
    }
}
