// Shader module loading and hot reload
//
// Vulkan consumes SPIR-V bytecode. Compiled words are read and validated on
// the host first (ShaderCode) and only then turned into modules, so a reload
// that finds a half-written file never touches the running pipeline.

use anyhow::{Context, Result};
use ash::vk;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use super::VulkanDevice;

/// Decode SPIR-V bytes into aligned words, checking size and magic number
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut std::io::Cursor::new(bytes)).context("Invalid SPIR-V bytecode")
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")
}

/// Validated SPIR-V for the vertex and fragment stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderCode {
    pub vert: Vec<u32>,
    pub frag: Vec<u32>,
}

impl ShaderCode {
    /// Read both stages; fails without side effects if either is unreadable
    pub fn load(vert_path: &Path, frag_path: &Path) -> Result<Self> {
        let vert = read_spirv(vert_path)?;
        let frag = read_spirv(frag_path)?;
        log::debug!(
            "Loaded shaders {:?} ({} words), {:?} ({} words)",
            vert_path,
            vert.len(),
            frag_path,
            frag.len()
        );
        Ok(Self { vert, frag })
    }
}

fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
    parse_spirv(&bytes).with_context(|| format!("Failed to load shader {:?}", path))
}

/// Shader module destroyed on drop; only needed until the pipeline exists
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    pub fn new(device: &Arc<VulkanDevice>, code: &[u32]) -> Result<Self> {
        let module = create_shader_module(device, code)?;
        Ok(Self {
            module,
            device: device.clone(),
        })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

/// Parent directories of the given shader files, without duplicates
pub fn watch_dirs<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Vec<&'a Path> {
    paths
        .into_iter()
        .map(|p| match p.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Watches the shader directories and raises a flag when anything changes
pub struct ShaderWatcher {
    _watcher: RecommendedWatcher,
    changed: Arc<AtomicBool>,
}

impl ShaderWatcher {
    pub fn new(dirs: &[&Path]) -> Result<Self> {
        let changed = Arc::new(AtomicBool::new(false));
        let flag = changed.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    log::info!("Shader change detected: {:?}", event.paths);
                    flag.store(true, Ordering::Release);
                }
                Ok(_) => {}
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        })
        .context("Failed to create shader watcher")?;

        for dir in dirs {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch {:?}", dir))?;
            log::info!("Watching {:?} for shader changes", dir);
        }

        Ok(Self {
            _watcher: watcher,
            changed,
        })
    }

    /// True once per batch of changes
    pub fn take_changed(&self) -> bool {
        self.changed.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn parses_little_endian_words() {
        let words = [SPIRV_MAGIC, 0x0001_0000, 7, 42];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();

        assert_eq!(parse_spirv(&bytes).unwrap(), words.to_vec());
    }

    #[test]
    fn rejects_truncated_bytecode() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(parse_spirv(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        let bytes = [0u8; 8];
        assert!(parse_spirv(&bytes).is_err());
    }

    fn spirv_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn wait_for_change(watcher: &ShaderWatcher) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if watcher.take_changed() {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn shader_code_rejects_half_written_file() {
        let dir = scratch_dir("shader-code-empty");
        let vert = dir.join("vert.spv");
        let frag = dir.join("frag.spv");
        std::fs::write(&vert, []).unwrap();
        std::fs::write(&frag, spirv_bytes(&[SPIRV_MAGIC, 0x0001_0000])).unwrap();

        let result = ShaderCode::load(&vert, &frag);
        let _ = std::fs::remove_dir_all(&dir);

        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("vert.spv"), "{}", message);
    }

    #[test]
    fn shader_code_loads_both_stages() {
        let dir = scratch_dir("shader-code-ok");
        let vert = dir.join("vert.spv");
        let frag = dir.join("frag.spv");
        std::fs::write(&vert, spirv_bytes(&[SPIRV_MAGIC, 1])).unwrap();
        std::fs::write(&frag, spirv_bytes(&[SPIRV_MAGIC, 2, 3])).unwrap();

        let code = ShaderCode::load(&vert, &frag);
        let _ = std::fs::remove_dir_all(&dir);

        let code = code.unwrap();
        assert_eq!(code.vert, vec![SPIRV_MAGIC, 1]);
        assert_eq!(code.frag, vec![SPIRV_MAGIC, 2, 3]);
    }

    #[test]
    fn watch_dirs_dedups_parents() {
        let vert = Path::new("shaders/vert.spv");
        let frag = Path::new("shaders/frag.spv");
        assert_eq!(watch_dirs([vert, frag]), vec![Path::new("shaders")]);

        let frag = Path::new("other/frag.spv");
        assert_eq!(
            watch_dirs([vert, frag]),
            vec![Path::new("other"), Path::new("shaders")]
        );

        assert_eq!(watch_dirs([Path::new("vert.spv")]), vec![Path::new(".")]);
    }

    #[test]
    fn watcher_flags_new_files() {
        let dir = scratch_dir("shader-watch");
        let watcher = ShaderWatcher::new(&[dir.as_path()]).unwrap();
        assert!(!watcher.take_changed());

        std::fs::write(dir.join("vert.spv"), [0u8; 4]).unwrap();

        let seen = wait_for_change(&watcher);
        let _ = std::fs::remove_dir_all(&dir);
        assert!(seen);
    }

    #[test]
    fn watcher_covers_every_directory() {
        let vert_dir = scratch_dir("shader-watch-vert");
        let frag_dir = scratch_dir("shader-watch-frag");
        let watcher = ShaderWatcher::new(&[vert_dir.as_path(), frag_dir.as_path()]).unwrap();

        std::fs::write(frag_dir.join("frag.spv"), [0u8; 4]).unwrap();

        let seen = wait_for_change(&watcher);
        let _ = std::fs::remove_dir_all(&vert_dir);
        let _ = std::fs::remove_dir_all(&frag_dir);
        assert!(seen);
    }
}
