//! 编译期生成 GIT_SHA、BUILD_TIMESTAMP 等元信息（供 version.rs 使用）

use vergen::EmitBuilder;

fn main() {
    // 非 git 检出（源码包构建）时 vergen 会失败，回退到占位值
    if EmitBuilder::builder()
        .build_timestamp()
        .git_sha(false)
        .emit()
        .is_err()
    {
        println!("cargo:rustc-env=VERGEN_GIT_SHA=unknown");
        println!("cargo:rustc-env=VERGEN_BUILD_TIMESTAMP=unknown");
    }
}
