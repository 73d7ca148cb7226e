//! Writer and component records, and the component-selection passes.
//!
//! The coordinator reports writers as flat component lists; the hierarchy
//! is encoded in each component's full path. Selection picks the maximal
//! set of components whose file descriptors stay inside the volumes being
//! snapshotted, then marks the shallowest eligible node of every included
//! subtree for explicit registration.

use tracing::debug;
use uuid::Uuid;

use pdvss_core::coordinator::{ComponentKind, ComponentMetadata, FileSpec, WriterMetadata};
use pdvss_core::platform::DiskTopology;

pub use pdvss_core::coordinator::DescriptorKind;

/// A file descriptor with its expansion results.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub kind: DescriptorKind,
    pub path: String,
    pub filespec: String,
    pub recursive: bool,
    /// `path` after environment expansion, with a trailing separator.
    pub expanded_path: String,
    /// Canonical volume of the expanded path, or the expanded path itself
    /// when it does not resolve to a volume.
    pub affected_volume: String,
}

impl FileDescriptor {
    fn from_spec(spec: &FileSpec, topology: &dyn DiskTopology) -> Self {
        let mut expanded_path = topology.expand_path(&spec.path);
        if !expanded_path.ends_with('\\') {
            expanded_path.push('\\');
        }
        let affected_volume = topology
            .volume_for_path(&expanded_path)
            .unwrap_or_else(|| expanded_path.clone());
        Self {
            kind: spec.kind,
            path: spec.path.clone(),
            filespec: spec.filespec.clone(),
            recursive: spec.recursive,
            expanded_path,
            affected_volume,
        }
    }
}

/// One writer-declared component with its derived selection state.
#[derive(Debug, Clone)]
pub struct ComponentRecord {
    pub writer_name: String,
    pub name: String,
    pub logical_path: String,
    /// `logical_path` and `name` joined with a single separator, always
    /// leading-slashed. The component hierarchy lives in these paths.
    pub full_path: String,
    pub kind: ComponentKind,
    pub is_selectable: bool,
    pub is_top_level: bool,
    pub is_excluded: bool,
    pub is_explicitly_included: bool,
    pub affected_paths: Vec<String>,
    pub affected_volumes: Vec<String>,
    pub descriptors: Vec<FileDescriptor>,
}

impl ComponentRecord {
    fn from_metadata(
        writer_name: &str,
        meta: &ComponentMetadata,
        topology: &dyn DiskTopology,
    ) -> Self {
        let descriptors: Vec<FileDescriptor> = meta
            .files
            .iter()
            .map(|spec| FileDescriptor::from_spec(spec, topology))
            .collect();

        let mut affected_paths = Vec::new();
        let mut affected_volumes = Vec::new();
        for desc in &descriptors {
            if !affected_paths.contains(&desc.expanded_path) {
                affected_paths.push(desc.expanded_path.clone());
            }
            if !affected_volumes.contains(&desc.affected_volume) {
                affected_volumes.push(desc.affected_volume.clone());
            }
        }
        affected_paths.sort();

        Self {
            writer_name: writer_name.to_string(),
            name: meta.name.clone(),
            logical_path: meta.logical_path.clone(),
            full_path: full_path(&meta.logical_path, &meta.name),
            kind: meta.kind,
            is_selectable: meta.selectable,
            is_top_level: false,
            is_excluded: false,
            is_explicitly_included: false,
            affected_paths,
            affected_volumes,
            descriptors,
        }
    }

    /// True when this component sits strictly above `descendant` in the
    /// same writer's hierarchy: its full path is a prefix at a segment
    /// boundary.
    pub fn is_ancestor_of(&self, descendant: &ComponentRecord) -> bool {
        if descendant.full_path.len() <= self.full_path.len() {
            return false;
        }
        let prefix = format!("{}/", self.full_path);
        let descendant_path = format!("{}/", descendant.full_path);
        descendant_path.starts_with(&prefix)
    }

    /// Eligible for explicit inclusion: not excluded, and either
    /// selectable or a top-level component.
    pub fn can_be_explicitly_included(&self) -> bool {
        !self.is_excluded && (self.is_selectable || self.is_top_level)
    }
}

/// One writer with its components.
#[derive(Debug, Clone)]
pub struct WriterRecord {
    /// Stable writer identity.
    pub id: Uuid,
    /// Per-run instance identity.
    pub instance_id: Uuid,
    pub name: String,
    pub excluded: bool,
    pub components: Vec<ComponentRecord>,
}

impl WriterRecord {
    pub fn from_metadata(meta: &WriterMetadata, topology: &dyn DiskTopology) -> Self {
        let mut components: Vec<ComponentRecord> = meta
            .components
            .iter()
            .map(|c| ComponentRecord::from_metadata(&meta.name, c, topology))
            .collect();

        // A component is top-level when nothing in this writer is its
        // ancestor.
        for i in 0..components.len() {
            let has_ancestor = (0..components.len())
                .any(|j| j != i && components[j].is_ancestor_of(&components[i]));
            components[i].is_top_level = !has_ancestor;
        }

        Self {
            id: meta.writer_id,
            instance_id: meta.instance_id,
            name: meta.name.clone(),
            excluded: false,
            components,
        }
    }
}

fn full_path(logical_path: &str, name: &str) -> String {
    let mut path = String::new();
    if !logical_path.starts_with('/') {
        path.push('/');
    }
    path.push_str(logical_path);
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str(name);
    path
}

/// Select the maximal component set whose file descriptors point only at
/// volumes in `volumes`. Four passes, in order; the result is recorded in
/// the `excluded` / `is_explicitly_included` flags.
pub fn select_components(writers: &mut [WriterRecord], volumes: &[String]) {
    discover_non_shadowed_exclusions(writers, volumes);
    discover_excluded_ancestors(writers);
    discover_excluded_writers(writers);
    discover_explicitly_included(writers);
}

/// Exclude components that require a volume outside the snapshot set.
fn discover_non_shadowed_exclusions(writers: &mut [WriterRecord], volumes: &[String]) {
    for writer in writers.iter_mut().filter(|w| !w.excluded) {
        for component in writer.components.iter_mut().filter(|c| !c.is_excluded) {
            let outside = component
                .affected_volumes
                .iter()
                .find(|av| !volumes.iter().any(|v| v.eq_ignore_ascii_case(av.as_str())));
            if let Some(volume) = outside {
                debug!(
                    component = %component.full_path,
                    writer = %component.writer_name,
                    volume = %volume,
                    "component excluded, it requires a volume outside the snapshot set"
                );
                component.is_excluded = true;
            }
        }
    }
}

/// Exclude every component that has an excluded descendant.
fn discover_excluded_ancestors(writers: &mut [WriterRecord]) {
    for writer in writers.iter_mut().filter(|w| !w.excluded) {
        let n = writer.components.len();
        for i in 0..n {
            if writer.components[i].is_excluded {
                continue;
            }
            let has_excluded_descendant = (0..n).any(|j| {
                writer.components[i].is_ancestor_of(&writer.components[j])
                    && writer.components[j].is_excluded
            });
            if has_excluded_descendant {
                debug!(
                    component = %writer.components[i].full_path,
                    "component excluded, it has an excluded descendant"
                );
                writer.components[i].is_excluded = true;
            }
        }
    }
}

/// Exclude writers with nothing left to include, or with an excluded
/// top-level non-selectable component.
fn discover_excluded_writers(writers: &mut [WriterRecord]) {
    for writer in writers.iter_mut().filter(|w| !w.excluded) {
        let has_includable = writer
            .components
            .iter()
            .any(|c| c.can_be_explicitly_included());
        if !has_includable {
            debug!(writer = %writer.name, "writer excluded, no includable components");
            writer.excluded = true;
            continue;
        }
        let broken_top_level = writer
            .components
            .iter()
            .any(|c| c.is_top_level && !c.is_selectable && c.is_excluded);
        if broken_top_level {
            debug!(
                writer = %writer.name,
                "writer excluded, a top-level non-selectable component is excluded"
            );
            writer.excluded = true;
        }
    }
}

/// Mark the shallowest eligible component of every included subtree.
fn discover_explicitly_included(writers: &mut [WriterRecord]) {
    for writer in writers.iter_mut().filter(|w| !w.excluded) {
        let n = writer.components.len();
        for i in 0..n {
            if !writer.components[i].can_be_explicitly_included() {
                continue;
            }
            let has_eligible_ancestor = (0..n).any(|j| {
                writer.components[j].is_ancestor_of(&writer.components[i])
                    && writer.components[j].can_be_explicitly_included()
            });
            writer.components[i].is_explicitly_included = !has_eligible_ancestor;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdvss_core::testing::{component, file_spec, writer, FakeTopology};

    fn topology() -> FakeTopology {
        let mut topo = FakeTopology::new();
        topo.set_env("SystemDrive", "C:");
        topo.map_path("C:\\data\\", "\\\\?\\Volume{cccc}\\");
        topo.map_path("D:\\logs\\", "\\\\?\\Volume{dddd}\\");
        topo
    }

    fn build(meta: WriterMetadata) -> WriterRecord {
        WriterRecord::from_metadata(&meta, &topology())
    }

    #[test]
    fn test_full_path_is_leading_slashed() {
        let w = build(writer(
            "sql",
            vec![
                component("db", "instances", true, vec![]),
                component("root", "", true, vec![]),
            ],
        ));
        assert_eq!(w.components[0].full_path, "/instances/db");
        assert_eq!(w.components[1].full_path, "/root");
    }

    #[test]
    fn test_ancestor_requires_segment_boundary() {
        let w = build(writer(
            "sql",
            vec![
                component("a", "", true, vec![]),
                component("b", "a", true, vec![]),
                component("ab", "", true, vec![]),
            ],
        ));
        let (a, a_b, ab) = (&w.components[0], &w.components[1], &w.components[2]);
        assert!(a.is_ancestor_of(a_b));
        assert!(!a.is_ancestor_of(ab)); // "/a" is not an ancestor of "/ab"
        assert!(!a_b.is_ancestor_of(a));
        assert!(!a.is_ancestor_of(a));
    }

    #[test]
    fn test_top_level_detection() {
        let w = build(writer(
            "sql",
            vec![
                component("root", "", false, vec![]),
                component("child", "root", true, vec![]),
                component("grandchild", "root/child", true, vec![]),
            ],
        ));
        assert!(w.components[0].is_top_level);
        assert!(!w.components[1].is_top_level);
        assert!(!w.components[2].is_top_level);
    }

    #[test]
    fn test_descriptor_expansion_and_volume() {
        let w = build(writer(
            "sql",
            vec![component(
                "db",
                "",
                true,
                vec![file_spec("%SystemDrive%\\data")],
            )],
        ));
        let desc = &w.components[0].descriptors[0];
        assert_eq!(desc.expanded_path, "C:\\data\\");
        assert_eq!(desc.affected_volume, "\\\\?\\Volume{cccc}\\");
        assert_eq!(w.components[0].affected_volumes, vec!["\\\\?\\Volume{cccc}\\"]);
    }

    #[test]
    fn test_unresolvable_path_falls_back_to_expanded_path() {
        let w = build(writer(
            "sql",
            vec![component("db", "", true, vec![file_spec("E:\\elsewhere")])],
        ));
        let desc = &w.components[0].descriptors[0];
        assert_eq!(desc.affected_volume, "E:\\elsewhere\\");
    }

    #[test]
    fn test_non_shadowed_component_is_excluded() {
        let mut writers = vec![build(writer(
            "sql",
            vec![
                component("inside", "", true, vec![file_spec("C:\\data")]),
                component("outside", "", true, vec![file_spec("D:\\logs")]),
            ],
        ))];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);
        assert!(!writers[0].components[0].is_excluded);
        assert!(writers[0].components[1].is_excluded);
        assert!(writers[0].components[0].is_explicitly_included);
        assert!(!writers[0].components[1].is_explicitly_included);
    }

    #[test]
    fn test_volume_compare_is_case_insensitive() {
        let mut writers = vec![build(writer(
            "sql",
            vec![component("db", "", true, vec![file_spec("C:\\data")])],
        ))];
        select_components(&mut writers, &["\\\\?\\VOLUME{CCCC}\\".to_string()]);
        assert!(!writers[0].components[0].is_excluded);
    }

    #[test]
    fn test_exclusion_propagates_to_ancestors() {
        let mut writers = vec![build(writer(
            "sql",
            vec![
                component("root", "", true, vec![]),
                component("child", "root", true, vec![file_spec("D:\\logs")]),
            ],
        ))];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);
        assert!(writers[0].components[1].is_excluded, "outside volume");
        assert!(writers[0].components[0].is_excluded, "excluded descendant");
        assert!(writers[0].excluded, "nothing left to include");
    }

    #[test]
    fn test_writer_with_no_includable_components_is_excluded() {
        let mut writers = vec![build(writer(
            "sql",
            // Non-selectable child of a top-level component: never
            // includable on its own, but the top-level one is.
            vec![component("db", "", false, vec![file_spec("D:\\logs")])],
        ))];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);
        assert!(writers[0].excluded);
    }

    #[test]
    fn test_excluded_top_level_non_selectable_excludes_writer() {
        let mut writers = vec![build(writer(
            "sql",
            vec![
                component("good", "", true, vec![file_spec("C:\\data")]),
                component("broken", "", false, vec![file_spec("D:\\logs")]),
            ],
        ))];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);
        assert!(writers[0].components[1].is_excluded);
        assert!(writers[0].excluded);
    }

    #[test]
    fn test_explicit_inclusion_picks_shallowest_eligible() {
        let mut writers = vec![build(writer(
            "sql",
            vec![
                component("root", "", true, vec![file_spec("C:\\data")]),
                component("child", "root", true, vec![file_spec("C:\\data")]),
            ],
        ))];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);
        assert!(writers[0].components[0].is_explicitly_included);
        assert!(!writers[0].components[1].is_explicitly_included);
    }

    #[test]
    fn test_child_included_when_ancestor_not_eligible() {
        let mut writers = vec![build(writer(
            "sql",
            vec![
                // Selectable root excluded by an outside volume; its child
                // stays inside the set and becomes the shallowest eligible
                // node of the subtree.
                component("root", "", true, vec![file_spec("D:\\logs")]),
                component("child", "root", true, vec![file_spec("C:\\data")]),
            ],
        ))];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);
        assert!(writers[0].components[0].is_excluded);
        assert!(!writers[0].excluded);
        assert!(writers[0].components[1].is_explicitly_included);
    }

    #[test]
    fn test_selection_invariants_hold() {
        let mut writers = vec![
            build(writer(
                "sql",
                vec![
                    component("root", "", false, vec![]),
                    component("data", "root", true, vec![file_spec("C:\\data")]),
                    component("logs", "root", true, vec![file_spec("D:\\logs")]),
                ],
            )),
            build(writer(
                "registry",
                vec![component("hive", "", false, vec![file_spec("C:\\data")])],
            )),
        ];
        select_components(&mut writers, &["\\\\?\\Volume{cccc}\\".to_string()]);

        for w in &writers {
            for (i, c) in w.components.iter().enumerate() {
                if c.is_explicitly_included {
                    assert!(!c.is_excluded);
                    assert!(c.is_selectable || c.is_top_level);
                    let eligible_ancestor = w.components.iter().enumerate().any(|(j, a)| {
                        j != i && a.is_ancestor_of(c) && a.can_be_explicitly_included()
                    });
                    assert!(!eligible_ancestor);
                }
                if w.components.iter().any(|d| c.is_ancestor_of(d) && d.is_excluded) {
                    assert!(c.is_excluded);
                }
            }
            if w.components
                .iter()
                .any(|c| c.is_top_level && !c.is_selectable && c.is_excluded)
            {
                assert!(w.excluded);
            }
        }
    }
}
